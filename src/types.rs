// =============================================================================
// Shared types used across the A-share market data service
// =============================================================================

use serde::{Deserialize, Serialize};

/// Exchange / namespace a symbol trades on. ETFs get their own virtual
/// market so that list and trend data stay in a parallel keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Market {
    SH,
    SZ,
    BJ,
    ETF,
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SH => write!(f, "SH"),
            Self::SZ => write!(f, "SZ"),
            Self::BJ => write!(f, "BJ"),
            Self::ETF => write!(f, "ETF"),
        }
    }
}

/// Board classification within an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Board {
    Main,
    /// 创业板 (SZ growth board, codes starting with 3).
    Gem,
    /// 科创板 (SH STAR market, 688/689 prefixes).
    Star,
    /// 北交所 (Beijing exchange).
    Bse,
    Etf,
}

/// Classify a 6-digit on-wire symbol into its exchange and board.
///
/// Returns `None` when the code is not 6 ASCII digits.
pub fn classify_symbol(symbol: &str) -> Option<(Market, Board)> {
    if symbol.len() != 6 || !symbol.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    if symbol.starts_with("688") || symbol.starts_with("689") {
        return Some((Market::SH, Board::Star));
    }
    if symbol.starts_with("43")
        || symbol.starts_with("83")
        || symbol.starts_with("87")
        || symbol.starts_with("88")
    {
        return Some((Market::BJ, Board::Bse));
    }

    match symbol.as_bytes()[0] {
        b'6' => Some((Market::SH, Board::Main)),
        b'0' => Some((Market::SZ, Board::Main)),
        b'3' => Some((Market::SZ, Board::Gem)),
        // 5xxxxx are Shanghai funds, 1xxxxx Shenzhen funds.
        b'5' => Some((Market::SH, Board::Etf)),
        b'1' => Some((Market::SZ, Board::Etf)),
        _ => None,
    }
}

/// Whether a 6-digit code names a fund rather than an equity.
pub fn is_etf_symbol(symbol: &str) -> bool {
    matches!(classify_symbol(symbol), Some((_, Board::Etf)))
}

/// Build the canonical `<symbol>.<exchange>` identifier for a 6-digit code.
pub fn ts_code_for(symbol: &str) -> Option<String> {
    let (market, board) = classify_symbol(symbol)?;
    let suffix = match (market, board) {
        (Market::SH, _) => "SH",
        (Market::SZ, _) => "SZ",
        (Market::BJ, _) => "BJ",
        (Market::ETF, _) => "SH",
    };
    Some(format!("{symbol}.{suffix}"))
}

/// Startup initialisation mode, selected via `STOCK_INIT_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitMode {
    /// Do nothing before the first scheduled tick.
    Skip,
    /// Signals, news and snapshots only; no bulk history refresh.
    TasksOnly,
    /// Refresh symbols + full bar refresh + signals.
    FullInit,
    /// ETF-scoped equivalents only.
    EtfOnly,
}

impl InitMode {
    /// Parse the mode from its configuration string, accepting the legacy
    /// aliases (`none`, `only_tasks`, `clear_all`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "skip" | "none" => Some(Self::Skip),
            "tasks_only" | "only_tasks" => Some(Self::TasksOnly),
            "full_init" | "clear_all" => Some(Self::FullInit),
            "etf_only" => Some(Self::EtfOnly),
            _ => None,
        }
    }
}

impl Default for InitMode {
    fn default() -> Self {
        Self::Skip
    }
}

impl std::fmt::Display for InitMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Skip => write!(f, "skip"),
            Self::TasksOnly => write!(f, "tasks_only"),
            Self::FullInit => write!(f, "full_init"),
            Self::EtfOnly => write!(f, "etf_only"),
        }
    }
}

/// Upstream data provider identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Tushare,
    Eastmoney,
    Sina,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tushare => write!(f, "tushare"),
            Self::Eastmoney => write!(f, "eastmoney"),
            Self::Sina => write!(f, "sina"),
        }
    }
}

/// Realtime provider selection, including the auto mode that picks by
/// historic success counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderChoice {
    Tushare,
    Eastmoney,
    Sina,
    Auto,
}

impl ProviderChoice {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "tushare" => Some(Self::Tushare),
            "eastmoney" => Some(Self::Eastmoney),
            "sina" => Some(Self::Sina),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

impl Default for ProviderChoice {
    fn default() -> Self {
        Self::Eastmoney
    }
}

impl std::fmt::Display for ProviderChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tushare => write!(f, "tushare"),
            Self::Eastmoney => write!(f, "eastmoney"),
            Self::Sina => write!(f, "sina"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Buy or sell verdict attached to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Buy,
    Sell,
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}
