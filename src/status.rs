//! Owner-facing status callback contract. The flow-editor layer (out of
//! scope here) renders these as the little colored badge next to a node;
//! the orchestrator only promises to emit one at each major transition.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFill {
    Green,
    Yellow,
    Red,
    Grey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusShape {
    Dot,
    Ring,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub owner_id: String,
    pub fill: StatusFill,
    pub shape: StatusShape,
    pub text: String,
    pub port: Option<u16>,
}

pub trait StatusSink: Send + Sync {
    fn status(&self, update: StatusUpdate);
}

/// Default sink that drops every update.
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn status(&self, _update: StatusUpdate) {}
}

/// Channel-backed sink, handy for UIs and tests alike.
impl StatusSink for tokio::sync::mpsc::UnboundedSender<StatusUpdate> {
    fn status(&self, update: StatusUpdate) {
        let _ = self.send(update);
    }
}
