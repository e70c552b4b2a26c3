//! Initial model states.

use crate::error::{EngineError, Result};
use crate::types::{ModelParams, ModelState};

/// Build the initial full state of a model.
///
/// Local variables start at `0.0` and parameter variables start at `nu`.
pub fn create(name: impl Into<String>, n: usize, m: usize, nu: f64) -> Result<ModelState> {
    let name = name.into();
    if name.is_empty() {
        return Err(EngineError::InvalidParameter("model name is empty".into()));
    }
    if !nu.is_finite() {
        return Err(EngineError::InvalidParameter(format!(
            "nu must be finite for {}, got {}",
            name, nu
        )));
    }

    let mut vector = Vec::with_capacity(n + m);
    vector.resize(n, 0.0);
    vector.resize(n + m, nu);

    Ok(ModelState {
        params: ModelParams { name, n, m, nu },
        vector,
    })
}

/// `count` evenly spaced values from `start` to `end` inclusive.
pub fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (count - 1) as f64;
            (0..count)
                .map(|i| if i + 1 == count { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// Create `count` models named `{prefix}1..={prefix}{count}` with `nu`
/// spread linearly over `nu_range`.
pub fn population(
    prefix: &str,
    count: usize,
    n: usize,
    m: usize,
    nu_range: (f64, f64),
) -> Result<Vec<ModelState>> {
    linspace(nu_range.0, nu_range.1, count)
        .into_iter()
        .enumerate()
        .map(|(i, nu)| create(format!("{}{}", prefix, i + 1), n, m, nu))
        .collect()
}
