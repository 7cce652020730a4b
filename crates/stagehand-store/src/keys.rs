//! The hierarchical key layout shared by every component that touches the
//! store. Nothing else in the workspace builds raw key strings.

/// Key builders for one testrun plus the global provider catalog.
#[derive(Debug, Clone)]
pub struct Keys;

impl Keys {
    /// `/environment/provider/{kind}/{id}` — global provider catalog.
    pub fn provider_catalog(kind: &str, id: &str) -> String {
        format!("/environment/provider/{kind}/{id}")
    }

    /// `/testrun/{id}/provider/` — prefix of the per-testrun bindings.
    pub fn binding_prefix(testrun_id: &str) -> String {
        format!("/testrun/{testrun_id}/provider/")
    }

    /// `/testrun/{id}/provider/{slot}` where slot is one of
    /// `iut`, `execution-space`, `log-area`, `dataset`.
    pub fn binding(testrun_id: &str, slot: &str) -> String {
        format!("/testrun/{testrun_id}/provider/{slot}")
    }

    /// `/testrun/{id}/suite/` — prefix of every persisted sub-suite.
    pub fn suite_prefix(testrun_id: &str) -> String {
        format!("/testrun/{testrun_id}/suite/")
    }

    /// `/testrun/{id}/suite/{sub_id}/subsuite/{env_id}/suite` — one persisted
    /// sub-suite payload.
    pub fn sub_suite(testrun_id: &str, sub_id: &str, env_id: &str) -> String {
        format!("/testrun/{testrun_id}/suite/{sub_id}/subsuite/{env_id}/suite")
    }

    /// `/testrun/{id}` — everything belonging to one testrun.
    pub fn testrun_prefix(testrun_id: &str) -> String {
        format!("/testrun/{testrun_id}")
    }

    /// `/testrun/{id}/environment-provider/task-id` — legacy task correlation.
    pub fn task_id(testrun_id: &str) -> String {
        format!("/testrun/{testrun_id}/environment-provider/task-id")
    }

    /// `/environment/{id}/suite-id` — for a task id this points at the
    /// testrun, for an environment id at its test suite started id. Both
    /// uses are legacy release-path pointers.
    pub fn suite_id_pointer(id: &str) -> String {
        format!("/environment/{id}/suite-id")
    }

    /// `/environment/{env_id}/testrun-id` — pointer used by single release.
    pub fn environment_testrun_id(env_id: &str) -> String {
        format!("/environment/{env_id}/testrun-id")
    }

    /// `/environment/{env_id}` — all pointers of one environment.
    pub fn environment_prefix(env_id: &str) -> String {
        format!("/environment/{env_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_suite_key_nests_under_the_suite_prefix() {
        let key = Keys::sub_suite("tr", "sub", "env");
        assert!(key.starts_with(&Keys::suite_prefix("tr")));
        assert_eq!(key, "/testrun/tr/suite/sub/subsuite/env/suite");
    }

    #[test]
    fn bindings_share_one_prefix() {
        for slot in ["iut", "execution-space", "log-area", "dataset"] {
            assert!(Keys::binding("tr", slot).starts_with(&Keys::binding_prefix("tr")));
        }
    }
}
