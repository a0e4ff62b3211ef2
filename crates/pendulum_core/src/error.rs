//! Error types for derivation, compilation and integration.

use thiserror::Error;

/// Errors that can abort a simulation run.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// Expression text could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A symbol is neither a state variable nor a parameter.
    #[error("Unknown variable or parameter: {0}")]
    UnknownSymbol(String),

    /// A function call the engine cannot evaluate or differentiate.
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// The equations of motion could not be solved in closed form.
    #[error("Derivation failed: {0}")]
    Derivation(String),

    /// The integrator gave up before reaching the end of the time grid.
    #[error("Integration failed at t = {t}: {reason}")]
    Integration {
        /// Time reached when the solver stopped.
        t: f64,
        /// What went wrong.
        reason: String,
    },

    /// Configuration values outside their valid range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for simulation operations.
pub type SimulationResult<T> = std::result::Result<T, SimulationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_details() {
        let err = SimulationError::UnknownSymbol("q3".to_string());
        assert_eq!(format!("{err}"), "Unknown variable or parameter: q3");

        let err = SimulationError::Integration {
            t: 12.5,
            reason: "step size underflow".to_string(),
        };
        let message = format!("{err}");
        assert!(message.contains("12.5"));
        assert!(message.contains("step size underflow"));
    }
}
