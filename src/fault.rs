//! Classification of tester reason codes into a closed fault taxonomy.

use std::fmt;

use serde::Serialize;

/// Why a continuity or shell-bond test failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FaultReason {
    /// Tip and sleeve swapped between the two ends.
    Reversed,
    /// Tip shorted to sleeve (`CROSSED` or `SHORT`).
    TipSleeveShort,
    NoCable,
    TipOpen,
    SleeveOpen,
    /// An XLR pin or shell conductor with no path end to end.
    Open(String),
    /// XLR conductors shorted together. `conductors` holds the two names
    /// when the code spells them out; `code` is always the raw token.
    Short {
        conductors: Option<(String, String)>,
        code: String,
    },
    NearShellOpen,
    FarShellOpen,
    /// A code outside the known vocabulary, kept verbatim.
    Other(String),
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultReason::Reversed => f.write_str("tip and sleeve reversed"),
            FaultReason::TipSleeveShort => f.write_str("tip shorted to sleeve"),
            FaultReason::NoCable => f.write_str("no cable detected"),
            FaultReason::TipOpen => f.write_str("tip open"),
            FaultReason::SleeveOpen => f.write_str("sleeve open"),
            FaultReason::Open(conductor) => write!(f, "{} open", conductor.to_lowercase()),
            FaultReason::Short {
                conductors: Some((a, b)),
                ..
            } => write!(f, "{} shorted to {}", a.to_lowercase(), b.to_lowercase()),
            FaultReason::Short {
                conductors: None,
                code,
            } => write!(f, "short ({code})"),
            FaultReason::NearShellOpen => f.write_str("near-end shell not bonded"),
            FaultReason::FarShellOpen => f.write_str("far-end shell not bonded"),
            FaultReason::Other(code) => write!(f, "unrecognised fault {code}"),
        }
    }
}

/// Maps a TS `REASON` code. Absent or blank codes mean no fault.
pub fn classify_ts(reason_code: Option<&str>) -> Option<FaultReason> {
    let code = reason_code.map(str::trim).filter(|c| !c.is_empty())?;
    let reason = match code {
        "REVERSED" => FaultReason::Reversed,
        "CROSSED" | "SHORT" => FaultReason::TipSleeveShort,
        "NO_CABLE" => FaultReason::NoCable,
        "TIP_OPEN" => FaultReason::TipOpen,
        "SLEEVE_OPEN" => FaultReason::SleeveOpen,
        other => FaultReason::Other(other.to_string()),
    };
    Some(reason)
}

/// Splits a compound XLR `REASON` list and classifies every token on its own.
pub fn classify_xlr(reason_code: Option<&str>) -> Vec<FaultReason> {
    reason_code
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(classify_xlr_token)
        .collect()
}

fn classify_xlr_token(token: &str) -> FaultReason {
    match token {
        "NO_CABLE" => return FaultReason::NoCable,
        "NEAR_SHELL_OPEN" => return FaultReason::NearShellOpen,
        "FAR_SHELL_OPEN" => return FaultReason::FarShellOpen,
        _ => {}
    }

    if let Some(conductor) = token.strip_suffix("_OPEN") {
        if !conductor.is_empty() {
            return FaultReason::Open(conductor.to_string());
        }
    }

    if token.contains("SHORT") {
        let names: Vec<&str> = token
            .split('_')
            .filter(|part| !part.is_empty() && *part != "SHORT")
            .collect();
        let conductors = match names.as_slice() {
            [a, b] => Some((a.to_string(), b.to_string())),
            _ => None,
        };
        return FaultReason::Short {
            conductors,
            code: token.to_string(),
        };
    }

    FaultReason::Other(token.to_string())
}
