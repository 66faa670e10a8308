//! GuidStore node executable: hosts a local cluster described by a layout
//! file until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use guidstore::{
    logger_init, pf_error, pf_info, ClusterConfig, GuidStoreError,
    LocalCluster,
};
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Cluster layout file in TOML format.
    #[arg(short, long)]
    layout: PathBuf,

    /// Override the layout's data directory.
    #[arg(short, long)]
    data_dir: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(GuidStoreError)` on any error.
    fn sanitize(&self) -> Result<(), GuidStoreError> {
        if self.layout.as_os_str().is_empty() {
            Err(GuidStoreError::msg("empty layout path"))
        } else if self.threads < 2 {
            Err(GuidStoreError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else if matches!(self.data_dir.as_deref(), Some("")) {
            Err(GuidStoreError::msg("empty data_dir override"))
        } else {
            Ok(())
        }
    }

    /// Reads the layout file, applying overrides.
    fn cluster_config(&self) -> Result<ClusterConfig, GuidStoreError> {
        let text = std::fs::read_to_string(&self.layout)?;
        let mut config = ClusterConfig::from_toml_str(&text)?;
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        Ok(config)
    }
}

/// Actual main function of GuidStore node.
fn node_main() -> Result<(), GuidStoreError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    let config = args.cluster_config()?;

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("n"; "error sending to term channel: {}", e);
        }
    })
    .map_err(|e| GuidStoreError::msg(e.to_string()))?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-node")
            .build()?;

        // enter tokio runtime, launch the cluster, and wait for termination
        runtime.block_on(async move {
            let cluster = LocalCluster::launch(config).await?;
            pf_info!("n"; "cluster up, replicas {:?}", cluster.running());

            rx_term.changed().await.map_err(|e| {
                GuidStoreError::msg(format!("term channel: {}", e))
            })?;
            pf_info!("n"; "caught termination signal");
            cluster.shutdown().await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            // type hint for this async closure
            Ok::<(), GuidStoreError>(())
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of GuidStore node.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = node_main() {
        pf_error!("n"; "node_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
