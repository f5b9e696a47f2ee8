use std::{
    env, fs,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use shared::domain::{FunnelId, StepId};

use super::read_funnels;

fn temp_file(name: &str, contents: &str) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("report_runner_{name}_{suffix}.json"));
    fs::write(&path, contents).expect("write funnels");
    path
}

#[test]
fn reads_a_bare_funnel_array() {
    let path = temp_file(
        "array",
        r#"[
            { "id": 1, "connection_id": 3, "steps": [{ "id": 10 }, { "id": 11 }] },
            { "id": 2, "connection_id": 3 }
        ]"#,
    );

    let funnels = read_funnels(&path).expect("funnels");
    fs::remove_file(&path).expect("cleanup");

    assert_eq!(funnels.len(), 2);
    assert_eq!(funnels[0].id, FunnelId(1));
    assert_eq!(funnels[0].steps[1].id, StepId(11));
    assert!(funnels[1].steps.is_empty());
}

#[test]
fn reads_a_data_envelope() {
    let path = temp_file(
        "envelope",
        r#"{ "data": [
            { "id": 5, "connection_id": 9, "steps": [{ "id": 1 }],
              "pivot": { "disabled_steps": [1] } }
        ] }"#,
    );

    let funnels = read_funnels(&path).expect("funnels");
    fs::remove_file(&path).expect("cleanup");

    assert_eq!(funnels.len(), 1);
    assert_eq!(funnels[0].disabled_steps(), Some(&[StepId(1)][..]));
}

#[test]
fn rejects_files_that_are_not_funnel_lists() {
    let path = temp_file("invalid", r#"{ "funnels": [] }"#);

    let err = read_funnels(&path).expect_err("must fail");
    fs::remove_file(&path).expect("cleanup");

    assert!(err.to_string().contains("is not a funnel list"), "{err}");
}
