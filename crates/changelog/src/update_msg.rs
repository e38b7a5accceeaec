use crate::csn::{Csn, CsnKeyed};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// An already decoded replicated change
///
/// The payload is opaque to the changelog: only the CSN takes part in
/// ordering, indexing and trimming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMsg {
    pub csn: Csn,
    pub entry_uuid: String,
    pub dn: String,
    pub payload: Bytes,
}

impl UpdateMsg {
    pub fn new(
        csn: Csn,
        entry_uuid: impl Into<String>,
        dn: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            csn,
            entry_uuid: entry_uuid.into(),
            dn: dn.into(),
            payload: payload.into(),
        }
    }
}

impl CsnKeyed for UpdateMsg {
    fn csn(&self) -> &Csn {
        &self.csn
    }
}
