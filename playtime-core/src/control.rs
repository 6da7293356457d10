use serde::{Deserialize, Serialize};

/// Out-of-band messages consumed by the poller.
///
/// Wire form is `{"kind": "<snake_case>"}`; unrecognised kinds decode as
/// `Unknown` so a bad sender can never take the control loop down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlMessage {
    AccountListChanged,
    #[serde(other)]
    Unknown,
}
