use crate::error::IntelError;

/// Local confidence at or above this value marks a locally-confirmed threat
/// and triggers the boost / floor behavior.
const BOOST_THRESHOLD: u8 = 75;

/// Fuses per-source confidence values into a single score.
///
/// Pure and deterministic: the same inputs always produce the same output.
/// Weights come from configuration and must sum to 1.0, which is re-checked
/// here so the correlator cannot be constructed in an invalid state.
#[derive(Debug, Clone)]
pub struct Correlator {
    local_weight: f64,
    external_weight: f64,
    boost: u8,
    minimum_final: u8,
}

impl Correlator {
    pub fn new(
        local_weight: f64,
        external_weight: f64,
        boost: u8,
        minimum_final: u8,
    ) -> Result<Self, IntelError> {
        if (local_weight + external_weight - 1.0).abs() > 1e-6 {
            return Err(IntelError::Config(format!(
                "confidence weights must sum to 1.0, got {}",
                local_weight + external_weight
            )));
        }
        Ok(Self {
            local_weight,
            external_weight,
            boost,
            minimum_final,
        })
    }

    /// Computes the final confidence. Returns `None` when neither source
    /// contributed, which callers treat as "no indicator".
    pub fn score(&self, local: Option<u8>, external: Option<u8>) -> Option<u8> {
        match (local, external) {
            (None, None) => None,
            (Some(local), None) => {
                let mut value = u16::from(local);
                if local >= BOOST_THRESHOLD {
                    value = (u16::from(local) + u16::from(self.boost))
                        .max(u16::from(self.minimum_final));
                }
                Some(value.min(100) as u8)
            }
            (None, Some(external)) => {
                let value = (f64::from(external) * self.external_weight).round();
                Some(value.clamp(0.0, 100.0) as u8)
            }
            (Some(local), Some(external)) => {
                let mut value = (f64::from(local) * self.local_weight
                    + f64::from(external) * self.external_weight)
                    .round();
                if local >= BOOST_THRESHOLD {
                    value = value.max(f64::from(self.minimum_final));
                }
                Some(value.clamp(0.0, 100.0) as u8)
            }
        }
    }
}
