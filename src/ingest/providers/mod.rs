pub mod alpha_vantage;
pub mod finnhub;
pub mod fixture;
pub(crate) mod http;
pub mod yahoo;

pub use alpha_vantage::AlphaVantageProvider;
pub use finnhub::FinnhubProvider;
pub use fixture::FixtureAdapter;
pub use yahoo::YahooProvider;

/// Env var holding the API key for a built-in provider.
pub fn api_key_env(name: &str) -> Option<&'static str> {
    match name {
        finnhub::NAME => Some("FINNHUB_API_KEY"),
        alpha_vantage::NAME => Some("ALPHA_VANTAGE_API_KEY"),
        yahoo::NAME => Some("YAHOO_FINANCE_API_KEY"),
        _ => None,
    }
}
