//! Assignment of checked-out IUTs to test-runner groups and round-robin
//! distribution of recipes inside each group.

use serde_json::Value;
use uuid::Uuid;

use stagehand_domain::{Resource, Test};

/// One IUT inside a group, together with everything the sub-suite built on
/// top of it will need.
#[derive(Debug, Clone)]
pub struct IutSlot {
    pub iut: Resource,
    pub sub_suite_id: Uuid,
    pub recipes: Vec<Test>,
    pub executor: Option<Resource>,
    pub log_area: Option<Resource>,
}

impl IutSlot {
    fn new(iut: Resource) -> Self {
        IutSlot {
            iut,
            sub_suite_id: Uuid::new_v4(),
            recipes: Vec::new(),
            executor: None,
            log_area: None,
        }
    }
}

/// All tests sharing one test runner. Lives only during one checkout.
#[derive(Debug, Clone)]
pub struct TestRunnerGroup {
    pub test_runner: String,
    pub priority: u32,
    pub unsplit_recipes: Vec<Test>,
    pub slots: Vec<IutSlot>,
    pub number_of_iuts: usize,
}

impl TestRunnerGroup {
    pub fn new(test_runner: impl Into<String>, priority: u32) -> Self {
        TestRunnerGroup {
            test_runner: test_runner.into(),
            priority,
            unsplit_recipes: Vec::new(),
            slots: Vec::new(),
            number_of_iuts: 0,
        }
    }

    /// Seed groups from the request's tests, keyed by test runner, in the
    /// order the runners first appear.
    pub fn from_tests(tests: &[Test]) -> Vec<TestRunnerGroup> {
        let mut groups: Vec<TestRunnerGroup> = Vec::new();
        for test in tests {
            let runner = &test.execution.test_runner;
            match groups.iter_mut().find(|g| &g.test_runner == runner) {
                Some(group) => group.unsplit_recipes.push(test.clone()),
                None => {
                    let mut group = TestRunnerGroup::new(runner.clone(), 1);
                    group.unsplit_recipes.push(test.clone());
                    groups.push(group);
                }
            }
        }
        groups
    }
}

/// Assign IUTs to groups proportionally to each group's share of the
/// remaining tests. Draws from the head of the IUT list, round-robin across
/// groups, until every group has its share or the IUTs run out; groups left
/// without IUTs wait for the next checkout iteration. Returns the unassigned
/// leftover.
pub fn assign_iuts(
    groups: &mut [TestRunnerGroup],
    mut iuts: Vec<Resource>,
    total_test_count: usize,
) -> Vec<Resource> {
    if total_test_count == 0 {
        return iuts;
    }
    let available = iuts.len();
    for group in groups.iter_mut() {
        group.slots = Vec::new();
        let percentage = group.unsplit_recipes.len() as f64 / total_test_count as f64;
        let mut number_of_iuts = ((available as f64 * percentage).round() as usize).max(1);
        // Never more IUTs than tests to put on them.
        number_of_iuts = number_of_iuts.min(group.unsplit_recipes.len());
        group.number_of_iuts = number_of_iuts;
    }

    loop {
        let mut assigned_any = false;
        for group in groups.iter_mut() {
            if group.slots.len() >= group.number_of_iuts {
                continue;
            }
            if iuts.is_empty() {
                return iuts;
            }
            group.slots.push(IutSlot::new(iuts.remove(0)));
            assigned_any = true;
        }
        let unfinished = groups.iter().any(|g| g.slots.len() < g.number_of_iuts);
        if !unfinished || !assigned_any {
            return iuts;
        }
    }
}

/// Distribute the group's unsplit recipes round-robin across its IUT slots.
/// After a successful call every recipe sits in exactly one slot.
pub fn split(group: &mut TestRunnerGroup) {
    if group.slots.is_empty() {
        return;
    }
    let recipes = std::mem::take(&mut group.unsplit_recipes);
    let slots = group.slots.len();
    for (index, recipe) in recipes.into_iter().enumerate() {
        group.slots[index % slots].recipes.push(recipe);
    }
}

/// How many tests are still waiting across all groups. Recomputed every
/// checkout iteration, since finished groups are dropped along the way.
pub fn total_test_count(groups: &[TestRunnerGroup]) -> usize {
    groups.iter().map(|g| g.unsplit_recipes.len()).sum()
}

/// The `maximum_amount` the IUT checkout may use: a dataset override wins,
/// then the configured parallelism cap, and the remaining test count bounds
/// both.
pub fn maximum_amount(
    dataset_override: Option<&Value>,
    configured_cap: Option<usize>,
    total_test_count: usize,
) -> usize {
    let cap = dataset_override
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .or(configured_cap)
        .unwrap_or(total_test_count);
    cap.min(total_test_count).max(1)
}
