// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while validating settings handed to a packager.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Creation {
    #[error("Quantile percentile {0} is outside of (0, 100)")]
    InvalidQuantile(f64),

    #[error("Quantile percentiles must be strictly ascending")]
    UnorderedQuantiles,
}

/// Errors returned by a [`crate::packager_service::PackagerHandle`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Service {
    #[error("Packager service is not running")]
    Closed,

    #[error("Packager service dropped the response channel")]
    ResponseDropped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Creation::InvalidQuantile(120.0).to_string(),
            "Quantile percentile 120 is outside of (0, 100)"
        );
        assert_eq!(
            Service::Closed.to_string(),
            "Packager service is not running"
        );
    }
}
