//! Human-readable and JSON output.

use corral_coordination::LeadershipEvent;
use corral_coordination::QueueItem;
use corral_coordination::WatchNotification;

/// Something the CLI can print in either format.
pub trait Outputable {
    fn to_json(&self) -> serde_json::Value;

    fn to_human(&self) -> String;
}

pub fn print_output<T: Outputable>(value: &T, json: bool) {
    if json {
        println!("{}", value.to_json());
    } else {
        println!("{}", value.to_human());
    }
}

/// Print a one-line confirmation.
pub fn print_success(message: &str, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "status": "success",
                "message": message
            })
        );
    } else {
        println!("{message}");
    }
}

/// Key-value pairs read from the store.
pub struct KvOutput {
    pub entries: Vec<(String, String)>,
}

impl Outputable for KvOutput {
    fn to_json(&self) -> serde_json::Value {
        let entries: Vec<_> =
            self.entries.iter().map(|(key, value)| serde_json::json!({ "key": key, "value": value })).collect();
        serde_json::json!({ "count": self.entries.len(), "entries": entries })
    }

    fn to_human(&self) -> String {
        if self.entries.is_empty() {
            return "No keys found.".to_string();
        }
        self.entries.iter().map(|(key, value)| format!("{key} = {value}")).collect::<Vec<_>>().join("\n")
    }
}

/// Result of a queue pop.
pub struct PopOutput {
    pub queue: String,
    pub item: Option<QueueItem>,
}

impl Outputable for PopOutput {
    fn to_json(&self) -> serde_json::Value {
        match &self.item {
            Some(item) => serde_json::json!({
                "queue": self.queue,
                "key": item.key,
                "value": item.value,
                "priority": item.priority,
                "sequence": item.sequence,
            }),
            None => serde_json::json!({ "queue": self.queue, "empty": true }),
        }
    }

    fn to_human(&self) -> String {
        match &self.item {
            Some(item) => format!("{} (priority {})", item.value, item.priority),
            None => format!("Queue '{}' is empty.", self.queue),
        }
    }
}

/// One election observation.
pub struct LeadershipOutput<'a> {
    pub key: &'a str,
    pub event: &'a LeadershipEvent,
}

impl Outputable for LeadershipOutput<'_> {
    fn to_json(&self) -> serde_json::Value {
        let (kind, leader, error) = match self.event {
            LeadershipEvent::Reset => ("reset", None, None),
            LeadershipEvent::NoLeader => ("no_leader", None, None),
            LeadershipEvent::Elected => ("elected", None, None),
            LeadershipEvent::Following { leader } => ("following", Some(leader.clone()), None),
            LeadershipEvent::QueryFailed { error } => ("query_failed", None, Some(error.to_string())),
        };
        serde_json::json!({
            "key": self.key,
            "event": kind,
            "is_leader": self.event.is_leader(),
            "leader": leader,
            "error": error,
        })
    }

    fn to_human(&self) -> String {
        match self.event {
            LeadershipEvent::Reset => format!("[{}] joined", self.key),
            LeadershipEvent::NoLeader => format!("[{}] no leader, campaigning", self.key),
            LeadershipEvent::Elected => format!("[{}] elected leader", self.key),
            LeadershipEvent::Following { leader } => format!("[{}] following {leader}", self.key),
            LeadershipEvent::QueryFailed { error } => format!("[{}] leader query failed: {error}", self.key),
        }
    }
}

/// One watch notification.
pub struct WatchOutput<'a>(pub &'a WatchNotification);

impl Outputable for WatchOutput<'_> {
    fn to_json(&self) -> serde_json::Value {
        match self.0 {
            WatchNotification::Event(event) => serde_json::json!({
                "type": event.kind.to_string(),
                "key": event.key,
                "value": event.value,
                "prev_value": event.prev_value,
                "revision": event.revision,
            }),
            WatchNotification::Disconnected => serde_json::json!({ "type": "DISCONNECTED" }),
        }
    }

    fn to_human(&self) -> String {
        match self.0 {
            WatchNotification::Event(event) => event.to_string(),
            WatchNotification::Disconnected => "-- disconnected, reconnecting".to_string(),
        }
    }
}
