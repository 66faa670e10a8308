//! GuidStore server state machine module implementation.

use std::collections::VecDeque;

use crate::server::{
    ApiRequest, Authorization, ClientId, Command, CommandResult, RecordStore,
    ReplicaTag, ReqBatch, RequestId, Status,
};
use crate::utils::GuidStoreError;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Execution action ID type.
pub type ExecActionId = u64;

/// Action to the executor, which owns the record store.
#[derive(Debug)]
pub enum ExecAction {
    /// Apply the batch decided at `slot`.
    Apply { slot: usize, reqs: ReqBatch },

    /// Serve a read against locally applied state.
    Inspect {
        client: ClientId,
        req_id: RequestId,
        key: String,
        requester: String,
        field: String,
    },

    /// Split a batch into requests that may be proposed and requests that
    /// current state already denies. A denial only holds if no other slot
    /// is pending application; the replica decides that on receipt.
    Precheck { reqs: ReqBatch },

    /// Copy out the whole store.
    Dump,

    /// Replace the whole store.
    Restore(Box<RecordStore>),
}

/// Result returned by the executor, one per action.
#[derive(Debug, PartialEq)]
pub enum ExecResult {
    /// `results` is `None` if the slot had been applied before.
    Applied {
        slot: usize,
        results: Option<Vec<CommandResult>>,
    },

    Inspected {
        client: ClientId,
        req_id: RequestId,
        result: CommandResult,
    },

    Prechecked {
        allowed: ReqBatch,
        denied: Vec<(ClientId, ApiRequest, CommandResult)>,
    },

    Dumped(Box<RecordStore>),

    Restored { next_slot: usize },

    /// Applying `slot` failed, e.g. because of a gap.
    Failed { slot: usize, error: GuidStoreError },
}

/// The local volatile state machine, driven by one executor task.
pub struct StateMachine {
    /// My replica tag.
    me: ReplicaTag,

    /// Sender side of the exec channel.
    tx_exec: mpsc::UnboundedSender<(ExecActionId, ExecAction)>,

    /// Receiver side of the ack channel.
    rx_ack: mpsc::UnboundedReceiver<(ExecActionId, ExecResult)>,

    /// Results that arrived while waiting on a synchronous action.
    stashed: VecDeque<(ExecActionId, ExecResult)>,

    /// Next action ID to hand out.
    next_id: ExecActionId,

    /// Join handle of the executor task.
    _executor_handle: JoinHandle<()>,
}

// StateMachine public API implementation
impl StateMachine {
    /// Creates a new state machine with one executor task owning `store`.
    pub async fn new_and_setup(
        me: ReplicaTag,
        store: RecordStore,
    ) -> Result<Self, GuidStoreError> {
        let (tx_exec, rx_exec) = mpsc::unbounded_channel();
        let (tx_ack, rx_ack) = mpsc::unbounded_channel();

        let executor_handle =
            tokio::spawn(Self::executor_task(me, store, rx_exec, tx_ack));

        Ok(StateMachine {
            me,
            tx_exec,
            rx_ack,
            stashed: VecDeque::new(),
            next_id: 0,
            _executor_handle: executor_handle,
        })
    }

    /// Submits an action by sending it to the exec channel.
    pub fn submit_action(
        &mut self,
        action: ExecAction,
    ) -> Result<ExecActionId, GuidStoreError> {
        let id = self.next_id;
        self.next_id += 1;
        self.tx_exec
            .send((id, action))
            .map_err(|e| GuidStoreError::msg(e.to_string()))?;
        Ok(id)
    }

    /// Waits for the next execution result. Cancellation safe.
    pub async fn get_result(
        &mut self,
    ) -> Result<(ExecActionId, ExecResult), GuidStoreError> {
        if let Some(stashed) = self.stashed.pop_front() {
            return Ok(stashed);
        }
        match self.rx_ack.recv().await {
            Some((id, result)) => Ok((id, result)),
            None => logged_err!(self.me; "ack channel has been closed"),
        }
    }

    /// Submits an action and waits for its result. Results of earlier
    /// actions arriving in the meantime are kept for later `get_result()`
    /// calls, in order.
    pub async fn do_sync_action(
        &mut self,
        action: ExecAction,
    ) -> Result<ExecResult, GuidStoreError> {
        let id = self.submit_action(action)?;
        loop {
            match self.rx_ack.recv().await {
                Some((rid, result)) if rid == id => return Ok(result),
                Some(other) => self.stashed.push_back(other),
                None => {
                    return logged_err!(self.me; "ack channel has been closed")
                }
            }
        }
    }
}

// StateMachine executor task implementation
impl StateMachine {
    /// Carries out one action on the store.
    fn execute(store: &mut RecordStore, action: ExecAction) -> ExecResult {
        match action {
            ExecAction::Apply { slot, reqs } => {
                match store.apply_slot(slot, &reqs) {
                    Ok(results) => ExecResult::Applied { slot, results },
                    Err(error) => ExecResult::Failed { slot, error },
                }
            }

            ExecAction::Inspect {
                client,
                req_id,
                key,
                requester,
                field,
            } => ExecResult::Inspected {
                client,
                req_id,
                result: store.inspect(&key, &requester, &field),
            },

            ExecAction::Precheck { reqs } => {
                let mut allowed = Vec::with_capacity(reqs.len());
                let mut denied = vec![];
                for (client, req) in reqs {
                    if store.precheck(client, &req) == Authorization::Deny {
                        let result = Self::denial(store, &req);
                        denied.push((client, req, result));
                    } else {
                        allowed.push((client, req));
                    }
                }
                ExecResult::Prechecked { allowed, denied }
            }

            ExecAction::Dump => ExecResult::Dumped(Box::new(store.clone())),

            ExecAction::Restore(new_store) => {
                *store = *new_store;
                ExecResult::Restored {
                    next_slot: store.next_slot(),
                }
            }
        }
    }

    /// Denial reply carrying the target record's current version.
    fn denial(store: &RecordStore, req: &ApiRequest) -> CommandResult {
        let version = match &req.cmd {
            Command::Record { key, .. } => {
                store.get(key).map(|r| r.version).unwrap_or(0)
            }
            Command::Reconfigure { .. } => store.epoch(),
        };
        CommandResult::status(Status::Denied, version)
    }

    /// Executor task function.
    async fn executor_task(
        me: ReplicaTag,
        mut store: RecordStore,
        mut rx_exec: mpsc::UnboundedReceiver<(ExecActionId, ExecAction)>,
        tx_ack: mpsc::UnboundedSender<(ExecActionId, ExecResult)>,
    ) {
        pf_debug!(me; "executor task spawned");

        while let Some((id, action)) = rx_exec.recv().await {
            let result = Self::execute(&mut store, action);
            if let ExecResult::Failed { slot, ref error } = result {
                pf_error!(me; "error applying slot {}: {}", slot, error);
            }

            if let Err(e) = tx_ack.send((id, result)) {
                pf_error!(me; "error sending to tx_ack: {}", e);
            }
        }

        // channel gets closed and no messages remain
        pf_debug!(me; "executor task exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Consistency, Operation};
    use bytes::Bytes;

    fn req(
        id: RequestId,
        key: &str,
        requester: &str,
        op: Operation,
    ) -> ApiRequest {
        ApiRequest {
            id,
            cmd: Command::Record {
                key: key.into(),
                requester: requester.into(),
                op,
            },
            consistency: Consistency::Coordinated,
            proof: None,
        }
    }

    async fn setup() -> Result<StateMachine, GuidStoreError> {
        StateMachine::new_and_setup(
            ReplicaTag::new(0, 0),
            RecordStore::new(1, vec![0, 1, 2]),
        )
        .await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn apply_in_order() -> Result<(), GuidStoreError> {
        let mut sm = setup().await?;
        sm.submit_action(ExecAction::Apply {
            slot: 0,
            reqs: vec![(1, req(0, "alice", "alice", Operation::CreateRecord))],
        })?;
        sm.submit_action(ExecAction::Apply {
            slot: 1,
            reqs: vec![(
                1,
                req(
                    1,
                    "alice",
                    "alice",
                    Operation::Write {
                        field: "email".into(),
                        value: Bytes::from_static(b"a@x.org"),
                    },
                ),
            )],
        })?;
        assert_eq!(
            sm.get_result().await?,
            (
                0,
                ExecResult::Applied {
                    slot: 0,
                    results: Some(vec![CommandResult::ok(1)])
                }
            )
        );
        assert_eq!(
            sm.get_result().await?,
            (
                1,
                ExecResult::Applied {
                    slot: 1,
                    results: Some(vec![CommandResult::ok(2)])
                }
            )
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn gap_fails() -> Result<(), GuidStoreError> {
        let mut sm = setup().await?;
        sm.submit_action(ExecAction::Apply {
            slot: 3,
            reqs: vec![],
        })?;
        let (_, result) = sm.get_result().await?;
        assert!(matches!(
            result,
            ExecResult::Failed {
                slot: 3,
                error: GuidStoreError::SlotGap { expected: 0, got: 3 }
            }
        ));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sync_action_stashes() -> Result<(), GuidStoreError> {
        let mut sm = setup().await?;
        let id = sm.submit_action(ExecAction::Apply {
            slot: 0,
            reqs: vec![(1, req(0, "alice", "alice", Operation::CreateRecord))],
        })?;
        let dumped = sm.do_sync_action(ExecAction::Dump).await?;
        match dumped {
            ExecResult::Dumped(store) => {
                assert_eq!(store.next_slot(), 1);
                assert!(store.get("alice").is_some());
            }
            _ => return Err(GuidStoreError::msg("unexpected exec result")),
        }
        let (rid, result) = sm.get_result().await?;
        assert_eq!(rid, id);
        assert!(matches!(result, ExecResult::Applied { slot: 0, .. }));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn precheck_and_inspect() -> Result<(), GuidStoreError> {
        let mut sm = setup().await?;
        sm.do_sync_action(ExecAction::Apply {
            slot: 0,
            reqs: vec![(1, req(0, "alice", "alice", Operation::CreateRecord))],
        })
        .await?;
        let read = Operation::Read {
            field: "ssn".into(),
        };
        let bobs = req(0, "alice", "bob", read.clone());
        let result = sm
            .do_sync_action(ExecAction::Precheck {
                reqs: vec![
                    (1, req(1, "alice", "alice", read)),
                    (2, bobs.clone()),
                    // already executed, so its retry passes
                    (1, req(0, "alice", "mallory", Operation::CreateRecord)),
                ],
            })
            .await?;
        match result {
            ExecResult::Prechecked { allowed, denied } => {
                assert_eq!(
                    allowed.iter().map(|(c, r)| (*c, r.id)).collect::<Vec<_>>(),
                    vec![(1, 1), (1, 0)]
                );
                assert_eq!(
                    denied,
                    vec![(2, bobs, CommandResult::status(Status::Denied, 1))]
                );
            }
            _ => return Err(GuidStoreError::msg("unexpected exec result")),
        }
        let result = sm
            .do_sync_action(ExecAction::Inspect {
                client: 2,
                req_id: 1,
                key: "alice".into(),
                requester: "bob".into(),
                field: "ssn".into(),
            })
            .await?;
        assert_eq!(
            result,
            ExecResult::Inspected {
                client: 2,
                req_id: 1,
                result: CommandResult::status(Status::Denied, 1)
            }
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restore_replaces() -> Result<(), GuidStoreError> {
        let mut sm = setup().await?;
        let mut other = RecordStore::new(4, vec![3]);
        other.apply_slot(0, &[])?;
        let result = sm
            .do_sync_action(ExecAction::Restore(Box::new(other.clone())))
            .await?;
        assert_eq!(result, ExecResult::Restored { next_slot: 1 });
        match sm.do_sync_action(ExecAction::Dump).await? {
            ExecResult::Dumped(store) => assert_eq!(*store, other),
            _ => return Err(GuidStoreError::msg("unexpected exec result")),
        }
        Ok(())
    }
}
