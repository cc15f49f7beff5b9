// Property-based tests for schedule naming and policy normalization

use common::config::PolicyDefinition;
use common::persistence::{safe_project_component, trigger_file_name, trigger_owner};
use common::policy::{normalize_policy_name, PolicyRegistry};
use common::tag::{all_engines, is_known_engine, normalize_engines};
use proptest::prelude::*;

proptest! {
    /// Every generated trigger name is recognized and attributed to its project
    #[test]
    fn property_trigger_name_owner(
        project_id in "[A-Za-z0-9_.@/-]{1,40}",
        branch in ".{0,60}",
        index in 0usize..10_000,
    ) {
        let name = trigger_file_name(&project_id, &branch, index);
        let owner = safe_project_component(&project_id);
        prop_assert_eq!(trigger_owner(&name), Some(owner.as_str()));
        prop_assert!(!name.contains('/'));
    }

    /// Separator and case variants of one name collapse to one policy
    #[test]
    fn property_policy_name_variants_collide(
        words in prop::collection::vec("[a-z][a-z0-9]{0,6}", 1..4),
    ) {
        let underscored = words.join("_");
        prop_assume!(!matches!(underscored.as_str(), "daily" | "hourly"));
        let dashed = words.join("-").to_uppercase();
        prop_assert_eq!(normalize_policy_name(&underscored), normalize_policy_name(&dashed));

        let registry = PolicyRegistry::from_definitions(&[
            PolicyDefinition { name: underscored.clone(), cron: "0 1 * * *".to_string() },
            PolicyDefinition { name: dashed.clone(), cron: "0 2 * * *".to_string() },
        ]);
        prop_assert_eq!(registry.lookup(&dashed), Some("0 1 * * *"));
    }

    /// Normalized engine sets are never empty and contain only known engines
    #[test]
    fn property_engine_normalization(list in "[a-zA-Z, ]{0,40}") {
        let engines = normalize_engines(&list);
        prop_assert!(!engines.is_empty());
        prop_assert!(engines.iter().all(|e| is_known_engine(e)));
        prop_assert!(engines.is_subset(&all_engines()));
    }
}
