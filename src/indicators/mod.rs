pub mod adx;
pub mod atr;
pub mod ma;
pub mod roc;
pub mod rsi;
