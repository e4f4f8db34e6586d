use aggregate::LogBlock;
use receipt::{sign_bytes, verify_bytes, Hash, UsageVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const BUNDLE_VERSION: u16 = 1;

/// Integer fixed-point value scaled by 1e9. All consensus-relevant economic
/// arithmetic runs on this type so that independent nodes computing the same
/// inputs get bit-identical results. No floats anywhere in this crate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize, Hash,
)]
pub struct Fixed(pub u128);

pub const FIXED_SCALE: u128 = 1_000_000_000;

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);
    pub const ONE: Fixed = Fixed(FIXED_SCALE);

    pub fn from_int(n: u64) -> Fixed {
        Fixed(n as u128 * FIXED_SCALE)
    }

    /// `whole.frac` where `frac` is in billionths, e.g. `from_parts(0, 350_000_000)` = 0.35.
    pub fn from_parts(whole: u64, billionths: u32) -> Fixed {
        Fixed(whole as u128 * FIXED_SCALE + billionths as u128)
    }

    pub fn checked_add(self, rhs: Fixed) -> Option<Fixed> {
        self.0.checked_add(rhs.0).map(Fixed)
    }

    pub fn checked_sub(self, rhs: Fixed) -> Option<Fixed> {
        self.0.checked_sub(rhs.0).map(Fixed)
    }

    pub fn checked_mul(self, rhs: Fixed) -> Option<Fixed> {
        self.0.checked_mul(rhs.0).map(|v| Fixed(v / FIXED_SCALE))
    }

    /// Floor division; deterministic by construction.
    pub fn checked_div(self, rhs: Fixed) -> Option<Fixed> {
        if rhs.0 == 0 {
            return None;
        }
        self.0.checked_mul(FIXED_SCALE).map(|v| Fixed(v / rhs.0))
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Fixed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}", self.0 / FIXED_SCALE, self.0 % FIXED_SCALE)
    }
}

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("weights must sum to exactly 1.0, got {0}")]
    WeightSum(Fixed),
    #[error("scale for {0} is zero; zero scales are a configuration error")]
    ZeroScale(&'static str),
    #[error("adoption factor {got} outside (0, {bound}]")]
    AdoptionFactor { got: Fixed, bound: Fixed },
    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DimWeights {
    pub cpu: Fixed,
    pub mem: Fixed,
    pub storage: Fixed,
    pub egress: Fixed,
    pub receipts: Fixed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DimScales {
    pub cpu: u64,
    pub mem: u64,
    pub storage: u64,
    pub egress: u64,
    pub receipts: u64,
}

pub const MAX_ADOPTION_FACTOR: Fixed = Fixed(10 * FIXED_SCALE);

/// Governance-supplied scoring parameters, delivered as versioned
/// configuration transactions. Construction is the validation boundary:
/// a params value that exists is a params value that is sound.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GovernanceParams {
    pub version: u64,
    pub weights: DimWeights,
    pub scales: DimScales,
    pub emission_scalar: Fixed,
    pub adoption_factor: Fixed,
}

impl GovernanceParams {
    pub fn new(
        version: u64,
        weights: DimWeights,
        scales: DimScales,
        emission_scalar: Fixed,
        adoption_factor: Fixed,
    ) -> Result<Self, ParamError> {
        let sum = [weights.cpu, weights.mem, weights.storage, weights.egress, weights.receipts]
            .into_iter()
            .try_fold(Fixed::ZERO, |acc, w| {
                acc.checked_add(w).ok_or(ParamError::Overflow("weight sum"))
            })?;
        if sum != Fixed::ONE {
            return Err(ParamError::WeightSum(sum));
        }
        for (name, scale) in [
            ("cpu", scales.cpu),
            ("mem", scales.mem),
            ("storage", scales.storage),
            ("egress", scales.egress),
            ("receipts", scales.receipts),
        ] {
            if scale == 0 {
                return Err(ParamError::ZeroScale(name));
            }
        }
        if adoption_factor.is_zero() || adoption_factor > MAX_ADOPTION_FACTOR {
            return Err(ParamError::AdoptionFactor {
                got: adoption_factor,
                bound: MAX_ADOPTION_FACTOR,
            });
        }
        Ok(Self {
            version,
            weights,
            scales,
            emission_scalar,
            adoption_factor,
        })
    }

    pub fn devnet_defaults() -> Self {
        GovernanceParams::new(
            1,
            DimWeights {
                cpu: Fixed::from_parts(0, 350_000_000),
                mem: Fixed::from_parts(0, 150_000_000),
                storage: Fixed::from_parts(0, 150_000_000),
                egress: Fixed::from_parts(0, 150_000_000),
                receipts: Fixed::from_parts(0, 200_000_000),
            },
            DimScales {
                cpu: 1000,
                mem: 1000,
                storage: 1,
                egress: 10,
                receipts: 100,
            },
            Fixed::from_int(1000),
            Fixed::ONE,
        )
        .expect("devnet defaults are valid")
    }
}

/// Raw usage score: Φ = Σᵢ wᵢ · (usageᵢ / scaleᵢ).
pub fn phi(usage: &UsageVector, params: &GovernanceParams) -> Result<Fixed, ParamError> {
    let terms = [
        (params.weights.cpu, usage.cpu_ms, params.scales.cpu),
        (params.weights.mem, usage.mem_mb_s, params.scales.mem),
        (params.weights.storage, usage.storage_gb_day, params.scales.storage),
        (params.weights.egress, usage.egress_mb, params.scales.egress),
        (params.weights.receipts, usage.receipt_count, params.scales.receipts),
    ];
    let mut total = Fixed::ZERO;
    for (weight, used, scale) in terms {
        let ratio = Fixed::from_int(used)
            .checked_div(Fixed::from_int(scale))
            .ok_or(ParamError::Overflow("usage/scale"))?;
        let term = weight
            .checked_mul(ratio)
            .ok_or(ParamError::Overflow("weight*ratio"))?;
        total = total.checked_add(term).ok_or(ParamError::Overflow("phi sum"))?;
    }
    Ok(total)
}

/// Normalized score: Γ(Φ) = Φ / (1 + Φ), always in [0, 1).
pub fn gamma(phi: Fixed) -> Result<Fixed, ParamError> {
    let denom = Fixed::ONE
        .checked_add(phi)
        .ok_or(ParamError::Overflow("1+phi"))?;
    phi.checked_div(denom).ok_or(ParamError::Overflow("phi/(1+phi)"))
}

/// Bounded minting signal: emission_scalar · Γ(Φ) · adoption_factor.
pub fn mint_signal(gamma: Fixed, params: &GovernanceParams) -> Result<Fixed, ParamError> {
    params
        .emission_scalar
        .checked_mul(gamma)
        .and_then(|v| v.checked_mul(params.adoption_factor))
        .ok_or(ParamError::Overflow("mint signal"))
}

/// Economic proof artifact over one or more LogBlocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoEBundle {
    pub version: u16,
    pub app_id: Uuid,
    pub log_block_roots: Vec<Hash>,
    pub usage_total: UsageVector,
    pub phi: Fixed,
    pub gamma: Fixed,
    pub mint_signal: Fixed,
    pub params_version: u64,
    pub window_start_ms: u64,
    pub window_end_ms: u64,
    pub fee_rate: Fixed,
    pub policy_score: Fixed,
    pub submitter_key: Vec<u8>,
    pub submitter_sig: Vec<u8>,
}

#[derive(Serialize)]
struct BundlePreimage<'a> {
    version: u16,
    app_id: &'a Uuid,
    log_block_roots: &'a [Hash],
    usage_total: &'a UsageVector,
    phi: Fixed,
    gamma: Fixed,
    mint_signal: Fixed,
    params_version: u64,
    window_start_ms: u64,
    window_end_ms: u64,
    fee_rate: Fixed,
    policy_score: Fixed,
    submitter_key: &'a [u8],
}

impl PoEBundle {
    pub fn bundle_id(&self) -> Hash {
        let preimage = BundlePreimage {
            version: self.version,
            app_id: &self.app_id,
            log_block_roots: &self.log_block_roots,
            usage_total: &self.usage_total,
            phi: self.phi,
            gamma: self.gamma,
            mint_signal: self.mint_signal,
            params_version: self.params_version,
            window_start_ms: self.window_start_ms,
            window_end_ms: self.window_end_ms,
            fee_rate: self.fee_rate,
            policy_score: self.policy_score,
            submitter_key: &self.submitter_key,
        };
        let bytes = bincode::serialize(&preimage).unwrap_or_default();
        *blake3::hash(&bytes).as_bytes()
    }

    pub fn verify_signature(&self) -> anyhow::Result<()> {
        verify_bytes(&self.submitter_key, &self.submitter_sig, &self.bundle_id())
    }

    /// Recompute Φ/Γ/mint from the bundle's own usage totals and check the
    /// stored values match bit-for-bit. How any validator audits a bundle's
    /// economics without trusting the submitter.
    pub fn verify_scores(&self, params: &GovernanceParams) -> anyhow::Result<()> {
        if params.version != self.params_version {
            anyhow::bail!(
                "bundle scored under params v{}, registry has v{}",
                self.params_version,
                params.version
            );
        }
        let expected_phi = phi(&self.usage_total, params)?;
        let expected_gamma = gamma(expected_phi)?;
        let expected_mint = mint_signal(expected_gamma, params)?;
        if expected_phi != self.phi || expected_gamma != self.gamma || expected_mint != self.mint_signal
        {
            anyhow::bail!("bundle scores do not recompute from usage totals");
        }
        Ok(())
    }
}

pub struct Scorer {
    key: ed25519_dalek::SigningKey,
}

impl Scorer {
    pub fn new(key: ed25519_dalek::SigningKey) -> Self {
        Self { key }
    }

    /// Sum usage across the referenced LogBlocks, compute the deterministic
    /// scores, and emit a signed bundle. All blocks must belong to one app.
    pub fn score(
        &self,
        blocks: &[LogBlock],
        params: &GovernanceParams,
        fee_rate: Fixed,
        policy_score: Fixed,
    ) -> anyhow::Result<PoEBundle> {
        let Some(first) = blocks.first() else {
            anyhow::bail!("cannot score an empty block set");
        };
        let mut usage_total = UsageVector::default();
        let mut window_start = u64::MAX;
        let mut window_end = 0u64;
        for block in blocks {
            if block.app_id != first.app_id {
                anyhow::bail!("bundle must reference a single app id");
            }
            block.verify_signature()?;
            usage_total = usage_total.checked_add(&block.usage_total)?;
            window_start = window_start.min(block.window_start_ms);
            window_end = window_end.max(block.window_end_ms);
        }
        let phi = phi(&usage_total, params)?;
        let gamma = gamma(phi)?;
        let mint = mint_signal(gamma, params)?;

        let mut bundle = PoEBundle {
            version: BUNDLE_VERSION,
            app_id: first.app_id,
            log_block_roots: blocks.iter().map(|b| b.merkle_root).collect(),
            usage_total,
            phi,
            gamma,
            mint_signal: mint,
            params_version: params.version,
            window_start_ms: window_start,
            window_end_ms: window_end,
            fee_rate,
            policy_score,
            submitter_key: self.key.verifying_key().to_bytes().to_vec(),
            submitter_sig: vec![],
        };
        bundle.submitter_sig = sign_bytes(&self.key, &bundle.bundle_id());
        tracing::debug!(app = %bundle.app_id, phi = %bundle.phi, gamma = %bundle.gamma, "scored bundle");
        Ok(bundle)
    }
}
