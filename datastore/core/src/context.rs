// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use datastore_config::Parameters;

#[cfg(test)]
use crate::metrics::test_metrics;
use crate::metrics::Metrics;

/// Context contains the node-wide configuration and metrics shared by all
/// components of this caching node.
#[derive(Clone)]
pub(crate) struct Context {
    /// Parameters of this node.
    pub parameters: Parameters,
    /// Metrics of this node.
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub(crate) fn new(parameters: Parameters, metrics: Arc<Metrics>) -> Self {
        Self {
            parameters,
            metrics,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> Self {
        Context::new(Parameters::default(), test_metrics())
    }

    #[cfg(test)]
    pub(crate) fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }
}
