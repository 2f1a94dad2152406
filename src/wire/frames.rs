use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::job::{JobAction, JobRequest};

/// The first frame on every connection to the master, dispatched on `role`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Hello {
    /// A user connection performing one action; the inner enum's fields
    /// sit beside `role` in the same object.
    User(UserAction),
    /// A worker announcing which job it executes.
    ///
    /// On the wire: `{role:"worker", jobId:"<uuid>"}`
    Worker {
        #[serde(rename = "jobId")]
        job_id: String,
    },
    /// A host-slave registering itself.
    ///
    /// On the wire: `{role:"slave", slaveId:"<uuid>"}`
    Slave {
        #[serde(rename = "slaveId")]
        slave_id: String,
    },
}

/// Actions carried by a user hello frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum UserAction {
    /// Create a job and reply with its serialized record.
    ///
    /// On the wire: `{role:"user", action:"submit", job:{…}}`
    Submit { job: JobRequest },
    /// Subscribe to the update stream of one job, or of every job when
    /// `jobId == "*"`. The current snapshot is pushed first.
    ///
    /// On the wire: `{role:"user", action:"query", jobId:"<uuid>"|"*"}`
    Query {
        #[serde(rename = "jobId")]
        job_id: String,
    },
    /// Fetch one artifact payload by its index within the job.
    ///
    /// On the wire: `{role:"user", action:"artifact", jobId:"<uuid>", artifact:<n>}`
    Artifact {
        #[serde(rename = "jobId")]
        job_id: String,
        artifact: usize,
    },
    /// Ask the running worker to stop its job.
    ///
    /// On the wire: `{role:"user", action:"stop", jobId:"<uuid>"}`
    Stop {
        #[serde(rename = "jobId")]
        job_id: String,
    },
    /// Accepted for forward compatibility; forwarded like stop and warned
    /// about by the worker.
    Pause {
        #[serde(rename = "jobId")]
        job_id: String,
    },
    Restart {
        #[serde(rename = "jobId")]
        job_id: String,
    },
}

/// A command sent by the master down a slave's control connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SlaveCommand {
    /// Fork a worker for this job and reply with its pid.
    ///
    /// On the wire: `{action:"submit", jobId:"<uuid>"}`
    Submit {
        #[serde(rename = "jobId")]
        job_id: String,
    },
    /// SIGTERM the worker for this job; its exit is reported via the
    /// normal update path.
    ///
    /// On the wire: `{action:"terminate", jobId:"<uuid>"}`
    Terminate {
        #[serde(rename = "jobId")]
        job_id: String,
    },
}

/// A report sent by a slave up its control connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SlaveReport {
    /// Ack of a submit; `pid` is null when the fork failed.
    ///
    /// On the wire: `{action:"submit", jobId:"<uuid>", pid:<n>|null}`
    Submit {
        #[serde(rename = "jobId")]
        job_id: String,
        pid: Option<u32>,
    },
    /// A forked worker exited.
    ///
    /// On the wire: `{action:"update", jobId:"<uuid>", returncode:<n>}`
    Update {
        #[serde(rename = "jobId")]
        job_id: String,
        returncode: i32,
    },
    /// Capacity advertisement.
    ///
    /// On the wire: `{action:"slave", working:<bool>}`
    #[serde(rename = "slave")]
    Working { working: bool },
}

/// A control action pushed to a worker connection.
///
/// On the wire: `{action:"stop"}`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionFrame {
    pub action: JobAction,
}

/// Reply to a user artifact query.
///
/// On the wire: `{artifact_type:"<type>", artifact:"<payload>"}`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactReply {
    pub artifact_type: crate::types::task::ArtifactType,
    pub artifact: String,
}

/// Orderly-shutdown sentinel, valid on every connection.
///
/// On the wire: `{bye:true}`
pub fn bye() -> Value {
    serde_json::json!({"bye": true})
}

/// Error sentinel, valid on every connection.
///
/// On the wire: `{error:"<message>"}`
pub fn error(message: &str) -> Value {
    serde_json::json!({"error": message})
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hello_dispatches_on_role() {
        let frame = json!({"role": "worker", "jobId": "j-1"});
        let hello: Hello = serde_json::from_value(frame).unwrap();
        assert!(matches!(hello, Hello::Worker { job_id } if job_id == "j-1"));

        let frame = json!({"role": "slave", "slaveId": "s-1"});
        assert!(matches!(
            serde_json::from_value::<Hello>(frame).unwrap(),
            Hello::Slave { .. }
        ));

        let frame = json!({"role": "user", "action": "query", "jobId": "*"});
        assert!(matches!(
            serde_json::from_value::<Hello>(frame).unwrap(),
            Hello::User(UserAction::Query { job_id }) if job_id == "*"
        ));
    }

    #[test]
    fn test_submit_carries_job_request() {
        let frame = json!({
            "role": "user",
            "action": "submit",
            "job": {"job_type": "youtube", "media": {"source": "x"}},
        });
        let Hello::User(UserAction::Submit { job }) = serde_json::from_value(frame).unwrap()
        else {
            panic!("expected submit");
        };
        assert_eq!(job.media.source, "x");
        assert!(job.media.metadata.is_empty());
    }

    #[test]
    fn test_unknown_role_and_action_fail() {
        assert!(serde_json::from_value::<Hello>(json!({"role": "ghost"})).is_err());
        assert!(serde_json::from_value::<Hello>(
            json!({"role": "user", "action": "evict", "jobId": "x"})
        )
        .is_err());
    }

    #[test]
    fn test_slave_frames_match_wire_format() {
        let report = SlaveReport::Submit {
            job_id: "j-1".into(),
            pid: Some(4242),
        };
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({"action": "submit", "jobId": "j-1", "pid": 4242})
        );

        let failed = SlaveReport::Submit {
            job_id: "j-1".into(),
            pid: None,
        };
        assert_eq!(
            serde_json::to_value(&failed).unwrap()["pid"],
            Value::Null
        );

        let report: SlaveReport =
            serde_json::from_value(json!({"action": "slave", "working": true})).unwrap();
        assert!(matches!(report, SlaveReport::Working { working: true }));

        let cmd = SlaveCommand::Terminate { job_id: "j-2".into() };
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"action": "terminate", "jobId": "j-2"})
        );
    }
}
