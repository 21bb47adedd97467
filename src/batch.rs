//! Replay/multiline batch bookkeeping and the pending-reaction
//! reconciler.
//!
//! History batches replay events out of causal order, so a reaction can
//! name a msgid the engine has not stored yet. Such reactions are held
//! here keyed by target msgid, re-attempted when a matching message is
//! appended, and swept when the enclosing batch ends; entries whose
//! target never materializes are dropped at that sweep.

use std::collections::HashMap;

use crate::state::BufferId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchKind {
    /// Replayed history; events inside it are catch-up, not live.
    Chathistory,
    /// Lines that form one logical multiline message to `target`.
    Multiline { target: String },
    /// Some other batch type; passed through untouched.
    Other,
}

/// One open `BATCH +id` frame.
#[derive(Debug)]
pub struct Batch {
    pub kind: BatchKind,
    /// Enclosing batch id, from the `batch` tag on the open line.
    pub parent: Option<String>,
    /// Tags carried on the open line (msgid/time for multiline batches).
    pub tags: HashMap<String, String>,
    /// Sender of the first collected line (multiline).
    pub sender: Option<String>,
    /// Collected multiline parts: (text, concatenate-with-previous).
    pub parts: Vec<(String, bool)>,
}

/// A reaction whose target message has not arrived yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReaction {
    pub buffer: BufferId,
    pub emoji: String,
    pub reactor: String,
    pub remove: bool,
}

/// Per-connection batch registry and pending-reaction map. Owned by the
/// connection, so disconnect teardown drops everything with it.
#[derive(Debug, Default)]
pub struct Reconciler {
    batches: HashMap<String, Batch>,
    pending: HashMap<String, Vec<PendingReaction>>,
}

impl Reconciler {
    pub fn new() -> Self {
        Reconciler::default()
    }

    pub fn open_batch(
        &mut self,
        id: &str,
        kind: BatchKind,
        parent: Option<&str>,
        tags: HashMap<String, String>,
    ) {
        self.batches.insert(
            id.to_string(),
            Batch {
                kind,
                parent: parent.map(|p| p.to_string()),
                tags,
                sender: None,
                parts: Vec::new(),
            },
        );
    }

    pub fn close_batch(&mut self, id: &str) -> Option<Batch> {
        self.batches.remove(id)
    }

    pub fn batch_mut(&mut self, id: &str) -> Option<&mut Batch> {
        self.batches.get_mut(id)
    }

    /// Whether a line tagged with this batch id sits (directly or through
    /// nesting) inside a history replay.
    pub fn is_replay(&self, batch_tag: Option<&str>) -> bool {
        let mut current = batch_tag;
        while let Some(id) = current {
            match self.batches.get(id) {
                Some(batch) => {
                    if batch.kind == BatchKind::Chathistory {
                        return true;
                    }
                    current = batch.parent.as_deref();
                }
                None => return false,
            }
        }
        false
    }

    /// Hold a reaction whose target msgid is not present yet.
    pub fn hold(&mut self, msgid: &str, reaction: PendingReaction) {
        self.pending.entry(msgid.to_string()).or_default().push(reaction);
    }

    /// Take every held reaction for a msgid that just arrived.
    pub fn take_for(&mut self, msgid: &str) -> Vec<PendingReaction> {
        self.pending.remove(msgid).unwrap_or_default()
    }

    /// Drain the whole pending map for the batch-end sweep.
    pub fn sweep(&mut self) -> Vec<(String, PendingReaction)> {
        let mut out = Vec::new();
        for (msgid, reactions) in std::mem::take(&mut self.pending) {
            for reaction in reactions {
                out.push((msgid.clone(), reaction));
            }
        }
        out
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ServerId;

    fn reaction() -> PendingReaction {
        PendingReaction {
            buffer: BufferId::channel(ServerId(1), "#ops"),
            emoji: "👍".to_string(),
            reactor: "bob".to_string(),
            remove: false,
        }
    }

    #[test]
    fn held_reaction_taken_exactly_once() {
        let mut rec = Reconciler::new();
        rec.hold("m1", reaction());
        assert_eq!(rec.take_for("m1").len(), 1);
        assert!(rec.take_for("m1").is_empty());
    }

    #[test]
    fn sweep_drains_everything() {
        let mut rec = Reconciler::new();
        rec.hold("m1", reaction());
        rec.hold("m1", PendingReaction {
            remove: true,
            ..reaction()
        });
        rec.hold("m2", reaction());

        let swept = rec.sweep();
        assert_eq!(swept.len(), 3);
        assert_eq!(rec.pending_count(), 0);
        assert!(rec.sweep().is_empty());
    }

    #[test]
    fn replay_detection_walks_parents() {
        let mut rec = Reconciler::new();
        rec.open_batch("outer", BatchKind::Chathistory, None, HashMap::new());
        rec.open_batch(
            "inner",
            BatchKind::Multiline {
                target: "#ops".to_string(),
            },
            Some("outer"),
            HashMap::new(),
        );

        assert!(rec.is_replay(Some("outer")));
        assert!(rec.is_replay(Some("inner")));
        assert!(!rec.is_replay(Some("unknown")));
        assert!(!rec.is_replay(None));

        rec.close_batch("outer");
        assert!(!rec.is_replay(Some("inner")));
    }
}
