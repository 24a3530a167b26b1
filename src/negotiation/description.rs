//! Session Descriptions
//!
//! Opakes Verhandlungsdokument mit Typ und Revision. Die Revision zählt die
//! Offers eines Negotiators; ein Answer trägt die Revision seines Offers.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpType::Offer => f.write_str("offer"),
            SdpType::Answer => f.write_str("answer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
    #[serde(default)]
    pub revision: u64,
}

impl SessionDescription {
    pub fn offer(sdp: String, revision: u64) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp,
            revision,
        }
    }

    pub fn answer(sdp: String, revision: u64) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp,
            revision,
        }
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }
}
