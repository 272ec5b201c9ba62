//! Messages of the `pb.Visit` service. Service stubs are generated by
//! `build.rs` into `visit_server` and `visit_client`.

use chrono::{DateTime, TimeZone, Utc};
use prost_types::Timestamp;

use crate::models::{Visit, VisitInput};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Id {
    #[prost(uint32, tag = "1")]
    pub id: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VisitRequest {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub first_name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub last_name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VisitResponse {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub first_name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub last_name: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "4")]
    pub created_at: ::core::option::Option<Timestamp>,
    #[prost(message, optional, tag = "5")]
    pub updated_at: ::core::option::Option<Timestamp>,
}

include!(concat!(env!("OUT_DIR"), "/pb.Visit.rs"));

pub fn to_timestamp(time: &DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: time.timestamp(),
        nanos: time.timestamp_subsec_nanos() as i32,
    }
}

/// `None` for timestamps outside chrono's range
pub fn from_timestamp(timestamp: &Timestamp) -> Option<DateTime<Utc>> {
    let nanos = u32::try_from(timestamp.nanos).ok()?;
    Utc.timestamp_opt(timestamp.seconds, nanos).single()
}

impl From<Visit> for VisitResponse {
    fn from(visit: Visit) -> Self {
        Self {
            id: visit.id,
            created_at: Some(to_timestamp(&visit.created_at)),
            updated_at: Some(to_timestamp(&visit.updated_at)),
            first_name: visit.first_name,
            last_name: visit.last_name,
        }
    }
}

impl From<VisitRequest> for VisitInput {
    fn from(request: VisitRequest) -> Self {
        VisitInput {
            id: request.id,
            first_name: request.first_name,
            last_name: request.last_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_visit_to_response_keeps_timestamps() {
        let created = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();
        let visit = Visit {
            id: 3,
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            created_at: created,
            updated_at: created + chrono::Duration::milliseconds(1500),
        };

        let response = VisitResponse::from(visit);
        assert_eq!(response.created_at.as_ref().map(|t| t.seconds), Some(created.timestamp()));
        assert_eq!(response.updated_at.as_ref().map(|t| t.nanos), Some(500_000_000));
        assert_eq!(
            response.updated_at.as_ref().and_then(from_timestamp),
            Some(created + chrono::Duration::milliseconds(1500))
        );
    }

    #[test]
    fn test_request_wire_tags() {
        let request = VisitRequest {
            id: 1,
            first_name: "Ad".to_string(),
            last_name: String::new(),
        };
        // field 1 varint, field 2 length-delimited
        assert_eq!(request.encode_to_vec(), vec![0x08, 0x01, 0x12, 0x02, b'A', b'd']);
    }
}
