//! In-memory simulation environment

use std::path::Path;
use std::sync::Arc;

use netsim_segmgrd::{
    parse_destination, JsonStateStore, MemoryStateStore, MockProvider, Outcome, Route, SegMgr,
    SegMgrError, SegMgrOptions, SegMgrResult, StateStore,
};
use tracing::debug;

use crate::fixtures::{Expect, Step, TestScenario};
use crate::verification::{VerificationError, VerifyResult};

/// Segment manager wired to a mock provider and a state store
pub struct SimEnv {
    pub mock: Arc<MockProvider>,
    pub store: Arc<dyn StateStore>,
    pub mgr: SegMgr,
}

impl SimEnv {
    /// Empty topology with in-memory state
    pub fn start() -> Self {
        Self::with_store(Arc::new(MemoryStateStore::new()))
    }

    /// Empty topology persisted to a JSON file
    pub fn with_json_state(path: impl AsRef<Path>) -> Self {
        Self::with_store(Arc::new(JsonStateStore::new(path.as_ref())))
    }

    fn with_store(store: Arc<dyn StateStore>) -> Self {
        let mock = Arc::new(MockProvider::new());
        let mgr = SegMgr::new(mock.clone(), store.clone(), SegMgrOptions::default());
        Self { mock, store, mgr }
    }

    /// A fresh manager restored from this environment's store
    ///
    /// The provider is shared, as a restarted daemon would see it.
    pub async fn restart(&self) -> SegMgrResult<SegMgr> {
        SegMgr::restore(self.mock.clone(), self.store.clone(), SegMgrOptions::default()).await
    }

    /// Runs one step
    pub async fn apply(&self, step: &Step) -> SegMgrResult<Outcome> {
        debug!("Applying {:?}", step);
        match step {
            Step::ConfigureInterface { node, request } => {
                self.mgr.configure_interface(node, request).await
            }
            Step::DeleteInterface { node, name } => self.mgr.delete_interface(node, name).await,
            Step::AddRoute {
                node,
                destination,
                next_hop,
            } => {
                let route = Route::parse(destination, next_hop)?;
                self.mgr.configure_route(node, route).await
            }
            Step::DeleteRoute { node, destination } => {
                let destination = parse_destination(destination).map_err(SegMgrError::from)?;
                self.mgr.delete_route(node, destination).await
            }
        }
    }

    /// Runs every step of a scenario, checking each expectation
    pub async fn run(&self, scenario: &TestScenario) -> VerifyResult<Vec<SegMgrResult<Outcome>>> {
        let mut results = Vec::with_capacity(scenario.steps.len());
        for (index, (step, expect)) in scenario.steps.iter().enumerate() {
            let result = self.apply(step).await;
            let matched = match (expect, &result) {
                (Expect::Outcome(status), Ok(outcome)) => outcome.status == *status,
                (Expect::ErrorContaining(text), Err(err)) => err.to_string().contains(text.as_str()),
                _ => false,
            };
            if !matched {
                return Err(VerificationError::StepMismatch {
                    scenario: scenario.name.clone(),
                    index,
                    expected: format!("{:?}", expect),
                    actual: match &result {
                        Ok(outcome) => format!("{:?}: {}", outcome.status, outcome.message),
                        Err(err) => format!("error: {}", err),
                    },
                });
            }
            results.push(result);
        }
        Ok(results)
    }
}
