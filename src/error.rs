use thiserror::Error as ThisError;

/// Shape and argument errors.
///
/// Returned inside [`anyhow::Error`], recover with `err.downcast_ref::<Error>()`.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum Error {
    #[error("expected shape {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("expected {expected} input features on axis {axis}, found {found}")]
    FeatureMismatch {
        axis: usize,
        expected: usize,
        found: usize,
    },
    #[error("{layer} expects {expected} spatial dimensions, found input with ndim {found}")]
    SpatialNdim {
        layer: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("invalid {name}: {reason}")]
    InvalidArgument { name: &'static str, reason: String },
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("{0} has unmaterialized parameters, call `build` with a sample input first")]
    Unmaterialized(&'static str),
    #[error("{0} is stochastic, call `forward_rng` or switch to eval mode")]
    MissingRng(&'static str),
    #[error("unknown {kind} {name:?}, available: {available}")]
    UnknownName {
        kind: &'static str,
        name: String,
        available: String,
    },
}

impl Error {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }
}

pub(crate) fn check_shape(expected: &[usize], found: &[usize]) -> Result<(), Error> {
    if expected != found {
        return Err(Error::ShapeMismatch {
            expected: expected.to_vec(),
            found: found.to_vec(),
        });
    }
    Ok(())
}

pub(crate) fn check_positive(name: &'static str, value: usize) -> Result<usize, Error> {
    if value == 0 {
        return Err(Error::invalid(name, "must be a positive integer"));
    }
    Ok(value)
}

pub(crate) fn check_rate(name: &'static str, value: f32) -> Result<f32, Error> {
    if !(0. ..=1.).contains(&value) {
        return Err(Error::invalid(name, format!("{value} is not in [0, 1]")));
    }
    Ok(value)
}
