use super::*;

#[test]
fn orders_stages_by_sort_order() {
    let registry = StageRegistry::new(vec![
        Stage::new("won", "Won", 2),
        Stage::new("new", "New", 0),
        Stage::new("open", "Open", 1),
    ])
    .expect("registry");

    let ids: Vec<&str> = registry.iter().map(|stage| stage.id.as_str()).collect();
    assert_eq!(ids, vec!["new", "open", "won"]);
    assert_eq!(registry.lowest().map(|stage| stage.id.as_str()), Some("new"));
    assert_eq!(registry.position(&StageId::new("won")), Some(2));
}

#[test]
fn rejects_duplicate_stage_ids() {
    let err = StageRegistry::new(vec![Stage::new("new", "New", 0), Stage::new("new", "Again", 1)])
        .expect_err("duplicate");
    assert_eq!(err, RegistryError::DuplicateStage(StageId::new("new")));
}

#[test]
fn equal_sort_orders_keep_input_order() {
    let registry = StageRegistry::new(vec![
        Stage::new("b", "B", 1),
        Stage::new("a", "A", 1),
        Stage::new("z", "Z", 0),
    ])
    .expect("registry");

    let ids: Vec<&str> = registry.iter().map(|stage| stage.id.as_str()).collect();
    assert_eq!(ids, vec!["z", "b", "a"]);
}

#[test]
fn presets_differ_only_in_stage_lists() {
    let prospects = StageRegistry::preset("prospects").expect("prospects preset");
    let deals = StageRegistry::preset("deals").expect("deals preset");
    assert_eq!(prospects.lowest().map(|stage| stage.id.as_str()), Some("new"));
    assert_eq!(deals.lowest().map(|stage| stage.id.as_str()), Some("lead"));
    assert!(StageRegistry::preset("unknown").is_none());
    assert!(StageRegistry::default().is_empty());
}
