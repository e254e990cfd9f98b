//! Dose-response mean with an optional hormesis bump.

use crate::input::ResponseType;

/// Sign convention of the curve, fixed by the response type at fit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveSign {
    /// `mu = c + (d - c + w f h(x)) / (1 + (x/e)^b)`.
    Stimulatory,
    /// `mu = c - (c - d + w f h(x)) / (1 + (x/e)^b)`.
    Inhibitory,
}

impl From<ResponseType> for CurveSign {
    fn from(response_type: ResponseType) -> Self {
        match response_type {
            ResponseType::Absorbance => Self::Stimulatory,
            ResponseType::Inhibition => Self::Inhibitory,
        }
    }
}

/// Hormesis indicator paired with its magnitude.
///
/// `Inactive` carries no magnitude, so the bump is exactly zero whatever value
/// `f` last held.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum HormesisTerm {
    #[default]
    Inactive,
    Active(f64),
}

impl HormesisTerm {
    /// Pair an indicator `w` with a magnitude `f`.
    #[must_use]
    pub const fn from_indicator(included: bool, magnitude: f64) -> Self {
        if included {
            Self::Active(magnitude)
        } else {
            Self::Inactive
        }
    }

    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active(_))
    }

    /// Magnitude when active.
    #[must_use]
    pub const fn magnitude(self) -> Option<f64> {
        match self {
            Self::Inactive => None,
            Self::Active(value) => Some(value),
        }
    }

    /// `w * f`, zero when inactive.
    #[must_use]
    pub const fn contribution(self) -> f64 {
        match self {
            Self::Inactive => 0.0,
            Self::Active(value) => value,
        }
    }

    /// Shift an active magnitude by `offset`; inactive terms stay inactive.
    #[must_use]
    pub fn shifted(self, offset: f64) -> Self {
        match self {
            Self::Inactive => Self::Inactive,
            Self::Active(value) => Self::Active(value + offset),
        }
    }
}

/// Curve parameters for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurveParameters {
    /// Floor `c`.
    pub floor: f64,
    /// Ceiling `d`.
    pub ceiling: f64,
    /// Effective dose `e`.
    pub effective_dose: f64,
    /// Slope `b`.
    pub slope: f64,
    /// Hormesis pair `(w, f)`.
    pub hormesis: HormesisTerm,
}

/// Dose-decaying hormesis shape `exp(-1 / x^alpha)`; tends to zero as `x -> 0+`.
#[must_use]
pub fn hormesis_decay(dose: f64, shape_exponent: f64) -> f64 {
    (-1.0 / dose.powf(shape_exponent)).exp()
}

/// Evaluate the dose-response mean.
///
/// Assumes `dose > 0` and positive `effective_dose`/`slope`; callers enforce those
/// supports, so out-of-domain inputs simply yield non-finite values.
#[must_use]
pub fn evaluate_curve(
    parameters: &CurveParameters,
    dose: f64,
    shape_exponent: f64,
    sign: CurveSign,
) -> f64 {
    let bump = match parameters.hormesis {
        HormesisTerm::Inactive => 0.0,
        HormesisTerm::Active(magnitude) => magnitude * hormesis_decay(dose, shape_exponent),
    };
    let denominator = 1.0 + (dose / parameters.effective_dose).powf(parameters.slope);
    match sign {
        CurveSign::Stimulatory => {
            parameters.floor + (parameters.ceiling - parameters.floor + bump) / denominator
        }
        CurveSign::Inhibitory => {
            parameters.floor - (parameters.floor - parameters.ceiling + bump) / denominator
        }
    }
}

/// Four-parameter log-logistic mean without hormesis, `c + (d - c) / (1 + (x/e)^b)`.
#[must_use]
pub fn log_logistic_mean(
    floor: f64,
    ceiling: f64,
    effective_dose: f64,
    slope: f64,
    dose: f64,
) -> f64 {
    floor + (ceiling - floor) / (1.0 + (dose / effective_dose).powf(slope))
}
