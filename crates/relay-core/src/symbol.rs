//! Instrument symbol normalization.
//!
//! Signals arrive as `BASE/QUOTE` pairs ("ADA/USDT"); the exchange
//! trades bare coins ("ADA").

/// Convert a signal symbol to the exchange coin name.
///
/// `"BTC/USDT"` → `"BTC"`, `"ada"` → `"ADA"`. Legacy futures-style names
/// (`PF_ADAUSD`) are stripped of their prefix and quote suffix.
pub fn to_exchange_coin(symbol: &str) -> String {
    base_symbol(symbol)
}

/// Extract the base asset used for signal matching.
pub fn base_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_ascii_uppercase();
    if let Some((base, _quote)) = upper.split_once('/') {
        return base.trim().to_string();
    }

    let mut base = upper.strip_prefix("PF_").unwrap_or(&upper);
    for quote in ["USDT", "USD"] {
        if let Some(stripped) = base.strip_suffix(quote) {
            if !stripped.is_empty() {
                base = stripped;
                break;
            }
        }
    }
    base.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_to_coin() {
        assert_eq!(to_exchange_coin("ADA/USDT"), "ADA");
        assert_eq!(to_exchange_coin("btc/usdt"), "BTC");
        assert_eq!(to_exchange_coin("ETH"), "ETH");
    }

    #[test]
    fn test_legacy_symbols() {
        assert_eq!(base_symbol("PF_ADAUSD"), "ADA");
        assert_eq!(base_symbol("SOLUSDT"), "SOL");
        assert_eq!(base_symbol(" xrp "), "XRP");
    }

    #[test]
    fn test_bare_quote_is_kept() {
        assert_eq!(base_symbol("USD"), "USD");
    }
}
