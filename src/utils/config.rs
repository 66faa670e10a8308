//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(GuidStoreError)` on parser failure or
/// on an unknown key.
///
/// Example:
/// ```no_compile
/// let config = parsed_config!(config_str => MyConfig; batch_size, data_dir)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        let compose_config =
            || -> Result<$config_type, $crate::GuidStoreError> {
                let mut config: $config_type = Default::default();
                let config_str = match config_str {
                    Some(s) => s,
                    None => return Ok(config),
                };

                let mut table = config_str.parse::<toml::Table>()?;

                $({
                    if let Some(v) = table.remove(stringify!($field)) {
                        config.$field = v.try_into()?;
                    }
                })+

                // leftover keys are not known fields
                if let Some(key) = table.keys().next() {
                    return Err($crate::GuidStoreError::msg(format!(
                        "invalid field name '{}' in config",
                        key
                    )));
                }

                Ok(config)
            };

        compose_config()
    }};
}
