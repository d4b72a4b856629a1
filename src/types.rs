use crate::membership::{Member, MemberStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub id: String,
    pub rpc_addr: String,
    pub is_leader: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetServersResponse {
    pub servers: Vec<ServerDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_name: String,
    pub rpc_addr: String,
    pub is_leader: bool,
    pub leader: Option<String>,
    pub term: u64,
    pub last_applied: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    pub name: String,
    pub addr: String,
    pub status: MemberStatus,
    pub tags: BTreeMap<String, String>,
}

impl From<Member> for MemberInfo {
    fn from(member: Member) -> Self {
        Self {
            name: member.name,
            addr: member.addr.to_string(),
            status: member.status,
            tags: member.tags,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembersResponse {
    pub members: Vec<MemberInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub leader: Option<String>,
}
