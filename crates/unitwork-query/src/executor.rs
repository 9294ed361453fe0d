//! Read-side collaborator trait.

use crate::plan::FetchPlan;
use asupersync::{Cx, Outcome};
use unitwork_core::{Error, Row};

/// Executes compiled fetch plans and returns raw rows.
///
/// Rows carry one column per selected storage column, labelled
/// `alias__column`. The result hydrator only ever consumes these rows; it
/// never issues storage commands itself.
pub trait QueryExecutor: Send + Sync {
    fn fetch(
        &self,
        cx: &Cx,
        plan: &FetchPlan,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;
}
