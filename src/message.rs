use serde::{Deserialize, Serialize};

// Reserved ID meaning "any/unknown": the destination of boot-time hello
// broadcasts and the leader header before any leader is known.
pub const BROADCAST: &str = "FFFF";

// LogEntry describes one accepted `put` request. Besides the term it was
// accepted in, an entry keeps the originating client context; serialized as
// `src`/`dst`/`mid` on the wire so that any future leader can satisfy
// duplicate checks and route the committed reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub key: String,
    pub value: String,
    #[serde(rename = "src")]
    pub client: String,
    #[serde(rename = "dst")]
    pub origin_leader: String,
    pub mid: String,
}

// Every datagram carries this envelope. `leader` is the sender's believed
// leader, BROADCAST if unknown; the record is self-describing through the
// flattened `type` tag of the body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub src: String,
    pub dst: String,
    pub leader: String,
    #[serde(flatten)]
    pub body: Body,
}

// Body describes the message types replicas and clients exchange. Raft
// traffic (vote and append records) and the client-facing records (get, put,
// ok, redirect) share one flat namespace, discriminated by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    // Emitted once to broadcast when a replica boots.
    Hello,
    // Client read request.
    Get {
        #[serde(rename = "MID")]
        mid: String,
        key: String,
    },
    // Client write request.
    Put {
        #[serde(rename = "MID")]
        mid: String,
        key: String,
        value: String,
    },
    // Reply to a client; `value` is present only for answered reads.
    Ok {
        #[serde(rename = "MID")]
        mid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    // Tells a client to retry against the leader named in the envelope.
    Redirect {
        #[serde(rename = "MID")]
        mid: String,
    },
    // Candidates solicit votes with the freshness of their log attached.
    // `last_log_index`/`last_log_term` are -1 for an empty log.
    RequestVote {
        term: u64,
        last_log_index: i64,
        last_log_term: i64,
    },
    // A vote grant. Denials are never sent; silence is a denial.
    RequestVoteResponse {
        term: u64,
    },
    // Log replication and heartbeats. `prev_log_index`/`prev_log_term` are
    // null on a heartbeat or when the entries start at index 0.
    // `leader_commit` is -1 until the leader has committed anything.
    Append {
        term: u64,
        prev_log_index: Option<u64>,
        prev_log_term: Option<u64>,
        entries: Vec<LogEntry>,
        leader_commit: i64,
    },
    // Follower's verdict on an append. `match_index` is the follower's
    // last log index, present only on success.
    AppendResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        match_index: Option<i64>,
    },
}

impl Envelope {
    pub fn new(src: &str, dst: &str, leader: &str, body: Body) -> Envelope {
        Envelope {
            src: src.to_string(),
            dst: dst.to_string(),
            leader: leader.to_string(),
            body,
        }
    }
}

// One datagram in, one record out. Missing envelope fields and unknown
// `type` tags both surface as a decode error for the caller to log and drop.
pub fn decode(raw: &[u8]) -> serde_json::Result<Envelope> {
    serde_json::from_slice(raw)
}

pub fn encode(msg: &Envelope) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn decodes_client_put() {
        let raw = br#"{"src":"cafe","dst":"0001","leader":"FFFF","type":"put","MID":"m17","key":"x","value":"1"}"#;
        let msg = decode(raw).unwrap();
        assert_eq!(msg.src, "cafe");
        assert_eq!(msg.dst, "0001");
        assert_eq!(msg.leader, BROADCAST);
        assert_eq!(
            msg.body,
            Body::Put {
                mid: "m17".to_string(),
                key: "x".to_string(),
                value: "1".to_string(),
            }
        );
    }

    #[test]
    fn decodes_append_with_null_prev() {
        let raw = br#"{"src":"0001","dst":"0002","leader":"0001","type":"append",
                       "term":1,"prev_log_index":null,"prev_log_term":null,
                       "entries":[{"term":1,"key":"x","value":"1","src":"cafe","dst":"0001","mid":"m1"}],
                       "leader_commit":-1}"#;
        let msg = decode(raw).unwrap();
        match msg.body {
            Body::Append {
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                assert_eq!(term, 1);
                assert_eq!(prev_log_index, None);
                assert_eq!(prev_log_term, None);
                assert_eq!(leader_commit, -1);
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].client, "cafe");
                assert_eq!(entries[0].origin_leader, "0001");
                assert_eq!(entries[0].mid, "m1");
            }
            other => panic!("decoded wrong body: {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_type() {
        let raw = br#"{"src":"0001","dst":"0002","leader":"FFFF","type":"gossip"}"#;
        assert!(decode(raw).is_err());
    }

    #[test]
    fn rejects_missing_envelope_field() {
        // No `leader`.
        let raw = br#"{"src":"0001","dst":"0002","type":"hello"}"#;
        assert!(decode(raw).is_err());
    }

    #[test]
    fn encodes_envelope_and_type_tag() {
        let msg = Envelope::new(
            "0001",
            "cafe",
            "0001",
            Body::Ok {
                mid: "m4".to_string(),
                value: Some(String::new()),
            },
        );
        let val: Value = serde_json::from_slice(&encode(&msg).unwrap()).unwrap();
        assert_eq!(val["src"], "0001");
        assert_eq!(val["dst"], "cafe");
        assert_eq!(val["leader"], "0001");
        assert_eq!(val["type"], "ok");
        assert_eq!(val["MID"], "m4");
        assert_eq!(val["value"], "");
    }

    #[test]
    fn write_ok_omits_value() {
        let msg = Envelope::new(
            "0001",
            "cafe",
            "0001",
            Body::Ok {
                mid: "m5".to_string(),
                value: None,
            },
        );
        let val: Value = serde_json::from_slice(&encode(&msg).unwrap()).unwrap();
        assert_eq!(val.get("value"), None);
    }

    #[test]
    fn entry_round_trips_client_context() {
        let entry = LogEntry {
            term: 3,
            key: "y".to_string(),
            value: "7".to_string(),
            client: "beef".to_string(),
            origin_leader: "0003".to_string(),
            mid: "m9".to_string(),
        };
        let val = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            val,
            json!({"term":3,"key":"y","value":"7","src":"beef","dst":"0003","mid":"m9"})
        );
        let back: LogEntry = serde_json::from_value(val).unwrap();
        assert_eq!(back, entry);
    }
}
