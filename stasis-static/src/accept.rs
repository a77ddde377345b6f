//! Accept-Encoding negotiation

use crate::compress::Encoding;
use crate::record::{AssetRecord, Variant};

/// Quality values are kept in thousandths, as the header allows at most three decimals
const Q_MAX: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Coding {
    Known(Encoding),
    Identity,
    Any,
    Other,
}

/// Parsed `Accept-Encoding` header
#[derive(Debug, Clone, Default)]
pub struct AcceptEncoding {
    entries: Vec<(Coding, u16)>,
    present: bool,
}

impl AcceptEncoding {
    /// Parse the header; `None` means the client sent none
    pub fn parse(header: Option<&str>) -> Self {
        let Some(header) = header else {
            return Self::default();
        };

        let mut entries = Vec::new();
        for item in header.split(',') {
            let mut parts = item.split(';');
            let name = parts.next().unwrap_or("").trim();
            if name.is_empty() {
                continue;
            }
            let mut quality = Some(Q_MAX);
            for param in parts {
                let Some((key, value)) = param.split_once('=') else {
                    continue;
                };
                if key.trim().eq_ignore_ascii_case("q") {
                    quality = parse_quality(value.trim());
                }
            }
            let Some(quality) = quality else {
                continue;
            };

            let coding = if name == "*" {
                Coding::Any
            } else if name.eq_ignore_ascii_case("identity") {
                Coding::Identity
            } else {
                Encoding::from_name(name).map(Coding::Known).unwrap_or(Coding::Other)
            };
            entries.push((coding, quality));
        }

        Self {
            entries,
            present: true,
        }
    }

    fn explicit(&self, coding: &Coding) -> Option<u16> {
        self.entries
            .iter()
            .filter(|(c, _)| c == coding)
            .map(|(_, q)| *q)
            .max()
    }

    /// Quality (0..=1000) the client assigns to a content coding
    pub fn quality(&self, encoding: Encoding) -> u16 {
        if !self.present {
            return 0;
        }
        self.explicit(&Coding::Known(encoding))
            .or_else(|| self.explicit(&Coding::Any))
            .unwrap_or(0)
    }

    /// Whether the client accepts the uncompressed representation
    pub fn accepts_identity(&self) -> bool {
        if !self.present {
            return true;
        }
        self.explicit(&Coding::Identity)
            .or_else(|| self.explicit(&Coding::Any).filter(|q| *q == 0))
            .map(|q| q > 0)
            .unwrap_or(true)
    }
}

fn parse_quality(value: &str) -> Option<u16> {
    let q: f32 = value.parse().ok()?;
    if !(0.0..=1.0).contains(&q) {
        return None;
    }
    Some((q * Q_MAX as f32).round() as u16)
}

/// Pick the variant to serve
///
/// The compressed variant with the highest quality wins, ties going to
/// the smaller one. Without an acceptable compressed variant the identity
/// is served, even when the client refused it.
pub fn select<'a>(record: &'a AssetRecord, accept: &AcceptEncoding) -> &'a Variant {
    let mut best: Option<(&Variant, u16)> = None;
    for variant in record.variants() {
        let Some(encoding) = variant.encoding else {
            continue;
        };
        let q = accept.quality(encoding);
        if q == 0 {
            continue;
        }
        best = match best {
            Some((current, best_q))
                if best_q > q || (best_q == q && current.size <= variant.size) =>
            {
                Some((current, best_q))
            }
            _ => Some((variant, q)),
        };
    }
    match best {
        Some((variant, _)) => variant,
        None => {
            if !accept.accepts_identity() {
                tracing::debug!("Identity refused for {}, serving it anyway", record.key());
            }
            record.identity()
        }
    }
}
