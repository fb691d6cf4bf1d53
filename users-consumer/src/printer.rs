use std::fmt;
use std::io::Write;

use common_kafka::{CommitDecision, Record};
use serde::{Deserialize, Deserializer};
use tracing::{error, warn};

/// A user as read back from the topic.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub email: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub created_at: String,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ID:{} Name:{} Email:{} CreatedAt:{}}}",
            self.id.unwrap_or_default(),
            self.name,
            self.email,
            self.created_at
        )
    }
}

/// Decode a record as a [`User`] and print it to `out`. Only printed users
/// are committed.
pub fn print_user<W: Write>(out: &mut W, record: &Record) -> CommitDecision {
    let user: User = match record.json() {
        Ok(user) => user,
        Err(e) => {
            error!(
                offset = record.offset(),
                partition = record.partition(),
                payload = %String::from_utf8_lossy(record.value()),
                "failed to decode user: {}",
                e
            );
            return CommitDecision::Malformed(e.to_string());
        }
    };

    if let Err(e) = writeln!(
        out,
        "Message offset={} partition={}: {}",
        record.offset(),
        record.partition(),
        user
    ) {
        warn!(offset = record.offset(), "failed to print user: {}", e);
        return CommitDecision::Hold;
    }
    CommitDecision::Commit
}
