pub mod mpesa;

pub use mpesa::{parse_callback, MpesaConfig, MpesaGateway, ParsedCallback};
