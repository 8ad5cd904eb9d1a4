//! The demo descriptions under `launch/` load and plan cleanly

use launch_tree::{
    Action, DescriptionSource, Executor, ExecutorConfig, FileSource, LaunchContext, PlanBackend,
};
use std::path::PathBuf;
use std::sync::Arc;

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[test]
fn demo_descriptions_parse() {
    let source = FileSource::new(workspace_root());

    let root = source.load("launch/default.launch.yaml").unwrap();
    assert_eq!(root.version, "1.0");
    let names: Vec<_> = root
        .declared_arguments()
        .iter()
        .map(|decl| decl.name.as_str())
        .collect();
    assert_eq!(names, vec!["second_robot", "rate"]);
    assert!(root
        .actions
        .iter()
        .any(|action| matches!(action, Action::OnEvent(_))));

    let talker = source.load("launch/talker.launch.yaml").unwrap();
    assert_eq!(talker.declared_arguments().len(), 2);
    match &talker.actions[2] {
        Action::Group(group) => assert!(matches!(group.actions[0], Action::Process(_))),
        other => panic!("unexpected action {}", other.kind()),
    }
}

#[tokio::test]
async fn demo_plan_follows_arguments() {
    let plan = |args: Vec<(&str, &str)>| {
        let backend = Arc::new(PlanBackend::new());
        let mut executor = Executor::new(
            Arc::new(FileSource::new(workspace_root())),
            backend.clone(),
            ExecutorConfig::default(),
        );
        let report = executor
            .run("launch/default.launch.yaml", LaunchContext::from_arguments(args))
            .unwrap();
        assert!(report.failures.is_empty(), "{:?}", report.failures);
        backend
            .requests()
            .into_iter()
            .map(|(_, config)| (config.name, config.args))
            .collect::<Vec<_>>()
    };

    let single = plan(Vec::new());
    assert_eq!(single.len(), 1);
    assert_eq!(single[0].0, "/robot1/talker");
    assert!(single[0].1[1].contains("sleep 1"));

    let both = plan(vec![("second_robot", "true"), ("rate", "2")]);
    let names: Vec<_> = both.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["/robot1/talker", "/robot2/talker"]);
    assert!(both[1].1[1].contains("robot2 tick"));
    assert!(both[1].1[1].contains("sleep 2"));
}
