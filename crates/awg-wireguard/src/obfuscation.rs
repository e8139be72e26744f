//! Obfuscation parameter generation.
//!
//! AmneziaWG disguises handshakes with junk packets (`Jc`, `Jmin`, `Jmax`),
//! padded init/response messages (`S1`, `S2`) and custom message-type
//! headers (`H1`..`H4`). `I1`..`I5` are free-form signature packets supplied
//! by the operator.

use crate::error::{Result, WireGuardError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Smallest MTU a tunnel may be created with.
pub const MIN_MTU: u16 = 1280;
/// Largest MTU a tunnel may be created with.
pub const MAX_MTU: u16 = 1440;

const S_MIN: u16 = 15;
const S_CAP: u16 = 150;
/// Init and response messages differ in size by this much; `S2 == S1 + 56`
/// would make them indistinguishable again.
const S2_RESERVED_OFFSET: u16 = 56;
const JC_RANGE: (u16, u16) = (4, 12);
const JMIN_FLOOR: u16 = 4;
const H_RANGES: [Range<u32>; 4] = [
    10_000..100_000,
    100_000..200_000,
    200_000..300_000,
    300_000..400_000,
];

/// Checks that an MTU lies inside the supported window.
///
/// # Errors
///
/// Returns [`WireGuardError::InvalidMtu`] when it does not.
pub fn check_mtu(mtu: u16) -> Result<()> {
    if (MIN_MTU..=MAX_MTU).contains(&mtu) {
        Ok(())
    } else {
        Err(WireGuardError::InvalidMtu {
            mtu,
            min: MIN_MTU,
            max: MAX_MTU,
        })
    }
}

/// Collapses a value onto a single line so it can be embedded in a
/// line-oriented configuration file.
#[must_use]
pub fn sanitize_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ").trim().to_string()
}

/// Free-form signature packets `I1`..`I5`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IParams {
    /// `I1`.
    #[serde(rename = "I1", default)]
    pub i1: String,
    /// `I2`.
    #[serde(rename = "I2", default)]
    pub i2: String,
    /// `I3`.
    #[serde(rename = "I3", default)]
    pub i3: String,
    /// `I4`.
    #[serde(rename = "I4", default)]
    pub i4: String,
    /// `I5`.
    #[serde(rename = "I5", default)]
    pub i5: String,
}

impl IParams {
    /// Returns a copy with every value reduced to a single trimmed line.
    #[must_use]
    pub fn sanitized(&self) -> Self {
        Self {
            i1: sanitize_value(&self.i1),
            i2: sanitize_value(&self.i2),
            i3: sanitize_value(&self.i3),
            i4: sanitize_value(&self.i4),
            i5: sanitize_value(&self.i5),
        }
    }

    /// All five values with their labels, in order.
    #[must_use]
    pub fn entries(&self) -> [(&'static str, &str); 5] {
        [
            ("I1", &self.i1),
            ("I2", &self.i2),
            ("I3", &self.i3),
            ("I4", &self.i4),
            ("I5", &self.i5),
        ]
    }

    /// Whether every value is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().iter().all(|(_, v)| v.is_empty())
    }
}

/// A partial update of `I1`..`I5`; absent values keep their current
/// contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IParamsUpdate {
    /// New `I1`.
    #[serde(rename = "I1", default, skip_serializing_if = "Option::is_none")]
    pub i1: Option<String>,
    /// New `I2`.
    #[serde(rename = "I2", default, skip_serializing_if = "Option::is_none")]
    pub i2: Option<String>,
    /// New `I3`.
    #[serde(rename = "I3", default, skip_serializing_if = "Option::is_none")]
    pub i3: Option<String>,
    /// New `I4`.
    #[serde(rename = "I4", default, skip_serializing_if = "Option::is_none")]
    pub i4: Option<String>,
    /// New `I5`.
    #[serde(rename = "I5", default, skip_serializing_if = "Option::is_none")]
    pub i5: Option<String>,
}

impl IParamsUpdate {
    /// Writes every provided value, sanitized, into `target`.
    pub fn apply_to(&self, target: &mut IParams) {
        let slots = [
            (&self.i1, &mut target.i1),
            (&self.i2, &mut target.i2),
            (&self.i3, &mut target.i3),
            (&self.i4, &mut target.i4),
            (&self.i5, &mut target.i5),
        ];
        for (update, slot) in slots {
            if let Some(value) = update {
                *slot = sanitize_value(value);
            }
        }
    }

    /// Whether no value is provided.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        [&self.i1, &self.i2, &self.i3, &self.i4, &self.i5]
            .iter()
            .all(|v| v.is_none())
    }
}

/// A complete obfuscation parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationParams {
    /// Junk packet count.
    #[serde(rename = "Jc")]
    pub jc: u16,
    /// Minimum junk packet size.
    #[serde(rename = "Jmin")]
    pub jmin: u16,
    /// Maximum junk packet size.
    #[serde(rename = "Jmax")]
    pub jmax: u16,
    /// Init message padding.
    #[serde(rename = "S1")]
    pub s1: u16,
    /// Response message padding.
    #[serde(rename = "S2")]
    pub s2: u16,
    /// Init message header.
    #[serde(rename = "H1")]
    pub h1: u32,
    /// Response message header.
    #[serde(rename = "H2")]
    pub h2: u32,
    /// Cookie message header.
    #[serde(rename = "H3")]
    pub h3: u32,
    /// Transport message header.
    #[serde(rename = "H4")]
    pub h4: u32,
    /// Signature packets.
    #[serde(flatten)]
    pub i_params: IParams,
}

impl ObfuscationParams {
    /// Draws a fresh parameter set for the given MTU.
    ///
    /// # Errors
    ///
    /// Returns an error if the MTU is outside the supported window or the
    /// `S2` candidate range is empty once the reserved value is excluded.
    pub fn generate<R: Rng + ?Sized>(mtu: u16, rng: &mut R) -> Result<Self> {
        check_mtu(mtu)?;

        let s1 = rng.gen_range(S_MIN..=s1_max(mtu));
        let s2 = draw_s2(s1, s2_max(mtu), rng)?;
        let jc = rng.gen_range(JC_RANGE.0..=JC_RANGE.1);
        let jmin = rng.gen_range(JMIN_FLOOR..=mtu - 2);
        let jmax = rng.gen_range(jmin + 1..=mtu);
        let [h1, h2, h3, h4] = H_RANGES.map(|range| rng.gen_range(range));

        Ok(Self {
            jc,
            jmin,
            jmax,
            s1,
            s2,
            h1,
            h2,
            h3,
            h4,
            i_params: IParams::default(),
        })
    }

    /// Checks every numeric constraint against the given MTU.
    ///
    /// # Errors
    ///
    /// Returns [`WireGuardError::InvalidObfuscation`] naming the first
    /// violated constraint.
    pub fn validate(&self, mtu: u16) -> Result<()> {
        check_mtu(mtu)?;
        let fail = |msg: String| Err(WireGuardError::InvalidObfuscation(msg));

        if !(S_MIN..=s1_max(mtu)).contains(&self.s1) {
            return fail(format!("S1 {} outside [{S_MIN}, {}]", self.s1, s1_max(mtu)));
        }
        if !(S_MIN..=s2_max(mtu)).contains(&self.s2) {
            return fail(format!("S2 {} outside [{S_MIN}, {}]", self.s2, s2_max(mtu)));
        }
        if self.s2 == self.s1 + S2_RESERVED_OFFSET {
            return fail(format!("S2 must not equal S1 + {S2_RESERVED_OFFSET}"));
        }
        if !(JC_RANGE.0..=JC_RANGE.1).contains(&self.jc) {
            return fail(format!("Jc {} outside [{}, {}]", self.jc, JC_RANGE.0, JC_RANGE.1));
        }
        if self.jmin < JMIN_FLOOR || self.jmin >= self.jmax || self.jmax > mtu {
            return fail(format!(
                "Jmin/Jmax {}/{} must satisfy {JMIN_FLOOR} <= Jmin < Jmax <= {mtu}",
                self.jmin, self.jmax
            ));
        }
        for ((label, value), range) in self.headers().iter().zip(H_RANGES.iter()) {
            if !range.contains(value) {
                return fail(format!(
                    "{label} {value} outside [{}, {})",
                    range.start, range.end
                ));
            }
        }
        Ok(())
    }

    fn headers(&self) -> [(&'static str, u32); 4] {
        [
            ("H1", self.h1),
            ("H2", self.h2),
            ("H3", self.h3),
            ("H4", self.h4),
        ]
    }

    /// The nine scalar lines written into an `[Interface]` block.
    #[must_use]
    pub fn scalar_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("Jc = {}", self.jc),
            format!("Jmin = {}", self.jmin),
            format!("Jmax = {}", self.jmax),
            format!("S1 = {}", self.s1),
            format!("S2 = {}", self.s2),
        ];
        lines.extend(
            self.headers()
                .iter()
                .map(|(label, value)| format!("{label} = {value}")),
        );
        lines
    }

    /// Signature lines for the non-empty `I` values, sanitized.
    #[must_use]
    pub fn signature_lines(&self) -> Vec<String> {
        self.i_params
            .sanitized()
            .entries()
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(label, v)| format!("{label} = {v}"))
            .collect()
    }
}

fn s1_max(mtu: u16) -> u16 {
    S_CAP.min(mtu.saturating_sub(148))
}

fn s2_max(mtu: u16) -> u16 {
    S_CAP.min(mtu.saturating_sub(92))
}

/// Draws `S2` uniformly from `[S_MIN, max]` minus `S1 + 56` without
/// rejection sampling.
fn draw_s2<R: Rng + ?Sized>(s1: u16, max: u16, rng: &mut R) -> Result<u16> {
    if max < S_MIN {
        return Err(WireGuardError::InvalidObfuscation(format!(
            "S2 range [{S_MIN}, {max}] is empty"
        )));
    }
    let reserved = s1 + S2_RESERVED_OFFSET;
    let excluded = (S_MIN..=max).contains(&reserved);
    let candidates = max - S_MIN + 1 - u16::from(excluded);
    if candidates == 0 {
        return Err(WireGuardError::InvalidObfuscation(format!(
            "no S2 candidate left after excluding {reserved}"
        )));
    }

    let mut value = S_MIN + rng.gen_range(0..candidates);
    if excluded && value >= reserved {
        value += 1;
    }
    Ok(value)
}
