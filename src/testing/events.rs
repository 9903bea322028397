//! Run events emitted to observers

use serde::Serialize;

use super::context::TestRecord;
use super::tree::{Group, Test};

/// Point-in-time view of a node
///
/// Groups only carry name and path; tests also carry their runtime record.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub path: String,
    #[serde(flatten)]
    pub record: Option<TestRecord>,
}

impl NodeSnapshot {
    pub fn group(group: &Group) -> Self {
        Self {
            name: group.name.clone(),
            path: group.path.clone(),
            record: None,
        }
    }

    pub fn test(test: &Test, record: TestRecord) -> Self {
        Self {
            name: test.name.clone(),
            path: test.path.clone(),
            record: Some(record),
        }
    }

    /// Nesting depth derived from the path; the root has depth 0
    pub fn depth(&self) -> usize {
        if self.path.is_empty() {
            0
        } else {
            self.path.split('.').count()
        }
    }
}

/// Something that happened during a run
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "node", rename_all = "camelCase")]
pub enum RunEvent {
    /// A run of the whole tree started
    Start,
    /// A run of the whole tree finished
    End,
    GroupStart(NodeSnapshot),
    GroupEnd(NodeSnapshot),
    TestStart(NodeSnapshot),
    TestEnd(NodeSnapshot),
}

impl RunEvent {
    /// The node this event is about, if any
    pub fn node(&self) -> Option<&NodeSnapshot> {
        match self {
            RunEvent::Start | RunEvent::End => None,
            RunEvent::GroupStart(node)
            | RunEvent::GroupEnd(node)
            | RunEvent::TestStart(node)
            | RunEvent::TestEnd(node) => Some(node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_event_json_shape() {
        let test = Test {
            name: "accepts".to_string(),
            path: "0.1".to_string(),
            body: None,
        };
        let event = RunEvent::TestStart(NodeSnapshot::test(&test, TestRecord::new(Utc::now())));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "testStart");
        assert_eq!(json["node"]["name"], "accepts");
        assert_eq!(json["node"]["path"], "0.1");
        assert_eq!(json["node"]["status"], "loading");

        let json = serde_json::to_value(RunEvent::Start).unwrap();
        assert_eq!(json["event"], "start");
    }

    #[test]
    fn test_group_snapshot_has_no_runtime_fields() {
        let group = Group {
            name: "Kick-off".to_string(),
            path: "2".to_string(),
            children: Vec::new(),
            hooks: Default::default(),
        };
        let snapshot = NodeSnapshot::group(&group);
        assert_eq!(snapshot.depth(), 1);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("status").is_none());
        assert!(json.get("startedAt").is_none());
    }
}
