pub mod attentive_rnn;
pub use attentive_rnn::{AttentiveRnn, AttentiveRnnConfig};

pub mod saint;
pub use saint::{Saint, SaintConfig};
