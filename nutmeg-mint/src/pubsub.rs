//! In-process topic bus behind the websocket subscriptions of
//! [Nut-17](https://github.com/cashubtc/nuts/blob/main/17.md). Delivery is
//! fan-out and best-effort: a slow subscriber loses old events instead of
//! blocking a state transition.

use nutmeg_core::primitives::{
    PostMeltQuoteBolt11Response, PostMintQuoteBolt11Response, ProofCheckState, ProofState,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{MeltQuote, MintQuote};

pub const MAX_SUBSCRIPTIONS_PER_CONNECTION: usize = 100;
pub const MAX_FILTERS_PER_SUBSCRIPTION: usize = 50;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Bolt11MintQuote,
    Bolt11MeltQuote,
    ProofState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NotificationPayload {
    MintQuote(PostMintQuoteBolt11Response),
    MeltQuote(PostMeltQuoteBolt11Response),
    ProofState(ProofCheckState),
}

impl NotificationPayload {
    /// The identifier subscription filters match against: the quote id for
    /// quote topics, `Y` for proof states.
    pub fn filter_key(&self) -> &str {
        match self {
            Self::MintQuote(quote) => &quote.quote,
            Self::MeltQuote(quote) => &quote.quote,
            Self::ProofState(state) => &state.y,
        }
    }
}

pub struct Publisher {
    mint_quotes: broadcast::Sender<NotificationPayload>,
    melt_quotes: broadcast::Sender<NotificationPayload>,
    proof_states: broadcast::Sender<NotificationPayload>,
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher {
    pub fn new() -> Self {
        Self {
            mint_quotes: broadcast::channel(CHANNEL_CAPACITY).0,
            melt_quotes: broadcast::channel(CHANNEL_CAPACITY).0,
            proof_states: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<NotificationPayload> {
        match topic {
            Topic::Bolt11MintQuote => self.mint_quotes.subscribe(),
            Topic::Bolt11MeltQuote => self.melt_quotes.subscribe(),
            Topic::ProofState => self.proof_states.subscribe(),
        }
    }

    pub fn publish_mint_quote(&self, quote: &MintQuote) {
        let _ = self
            .mint_quotes
            .send(NotificationPayload::MintQuote(quote.into()));
    }

    pub fn publish_melt_quote(&self, quote: &MeltQuote) {
        let _ = self
            .melt_quotes
            .send(NotificationPayload::MeltQuote(quote.into()));
    }

    pub fn publish_proof_state(&self, y: String, state: ProofState, witness: Option<String>) {
        let _ = self
            .proof_states
            .send(NotificationPayload::ProofState(ProofCheckState {
                y,
                state,
                witness,
            }));
    }
}
