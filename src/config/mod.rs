//! Loading analyzer parameters from JSON.
//!
//! Missing fields take their defaults, so a file only lists what it changes.
//! Both loaders run [`AnalyzerParams::validate`] before returning.

use crate::analyzer::AnalyzerParams;
use crate::error::Result;
use log::debug;
use std::fs;
use std::path::Path;

/// Read and validate parameters from a JSON file.
pub fn load_params(path: &Path) -> Result<AnalyzerParams> {
    let contents = fs::read_to_string(path)?;
    let params = params_from_json(&contents)?;
    debug!("load_params: loaded {}", path.display());
    Ok(params)
}

/// Parse and validate parameters from a JSON document.
pub fn params_from_json(json: &str) -> Result<AnalyzerParams> {
    let params: AnalyzerParams = serde_json::from_str(json)?;
    params.validate()?;
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AnalysisError;

    #[test]
    fn empty_document_yields_defaults() {
        let params = params_from_json("{}").unwrap();
        assert_eq!(params.min_points, 12);
        assert_eq!(params.validation.variance_threshold, 0.14);
    }

    #[test]
    fn malformed_json_is_reported() {
        let err = params_from_json("{ \"min_points\": ").unwrap_err();
        assert!(matches!(err, AnalysisError::Json(_)), "got {err:?}");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = params_from_json(r#"{ "min_points": 2 }"#).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidConfig(_)), "got {err:?}");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_params(Path::new("/nonexistent/container-params.json")).unwrap_err();
        assert!(matches!(err, AnalysisError::Io(_)), "got {err:?}");
    }
}
