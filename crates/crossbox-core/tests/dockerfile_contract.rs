//! The rendered Dockerfile honours the image contract.

use crossbox_core::fakes::FakeRemote;
use crossbox_core::{
    render_dockerfile, ProvisionConfig, ProvisionPlan, ProvisionStep, RemoteSource,
    CONTRACT_KEYS,
};

fn pinned_plan() -> ProvisionPlan {
    let plan = ProvisionConfig::default().into_plan().unwrap();
    plan.with_image_digest(FakeRemote::digest_for("ubuntu:18.04"))
}

/// Instruction keywords, ignoring comments and continuation lines.
fn instructions(dockerfile: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut continued = false;
    for line in dockerfile.lines() {
        let trimmed = line.trim();
        let starts_instruction = !continued && !trimmed.is_empty() && !trimmed.starts_with('#');
        if starts_instruction {
            if let Some(keyword) = trimmed.split_whitespace().next() {
                out.push(keyword);
            }
        }
        continued = trimmed.ends_with('\\');
    }
    out
}

#[test]
fn test_single_exec_form_entrypoint_and_no_cmd() {
    let text = render_dockerfile(&pinned_plan());
    let keywords = instructions(&text);

    assert_eq!(keywords.iter().filter(|k| **k == "ENTRYPOINT").count(), 1);
    assert!(!keywords.contains(&"CMD"));
    assert!(!keywords.contains(&"SHELL"));
    assert_eq!(keywords.last(), Some(&"ENTRYPOINT"));
    assert!(text.contains("ENTRYPOINT [\"/entrypoint.sh\"]\n"));
}

#[test]
fn test_from_is_pinned_to_the_resolved_digest() {
    let text = render_dockerfile(&pinned_plan());
    let from: Vec<&str> = text.lines().filter(|l| l.starts_with("FROM ")).collect();
    assert_eq!(from.len(), 1);
    assert_eq!(
        from[0],
        format!(
            "FROM ubuntu:18.04@{}",
            FakeRemote::digest_for("ubuntu:18.04")
        )
    );
}

#[test]
fn test_env_block_carries_every_contract_key() {
    let plan = pinned_plan();
    let text = render_dockerfile(&plan);
    for key in CONTRACT_KEYS {
        let value = plan.contract.get(key).unwrap();
        assert!(
            text.contains(&format!("{}=\"{}\"", key, value)),
            "missing {} in ENV block",
            key
        );
    }
    assert_eq!(instructions(&text).iter().filter(|k| **k == "ENV").count(), 1);
}

#[test]
fn test_steps_render_in_plan_order() {
    let text = render_dockerfile(&pinned_plan());
    let positions: Vec<usize> = ProvisionStep::ALL[1..]
        .iter()
        .map(|step| {
            text.find(&format!(". {} (layer ", step))
                .unwrap_or_else(|| panic!("step {} not rendered", step))
        })
        .collect();
    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted);

    assert!(text.contains("apt-get install -y --no-install-recommends build-essential"));
    assert!(text.contains("sh /tmp/crossbox-rustup-init.sh -y --profile minimal --default-toolchain nightly --no-modify-path"));
    assert!(text.contains(
        "RUN rustup target add --toolchain nightly-x86_64-unknown-linux-gnu x86_64-unknown-linux-musl\n"
    ));
    assert!(text.contains(
        "rustup show active-toolchain | grep -q '^nightly-x86_64-unknown-linux-gnu '"
    ));
    assert!(text.contains(
        "--installed --toolchain nightly-x86_64-unknown-linux-gnu | grep -qx x86_64-unknown-linux-musl"
    ));
}

#[test]
fn test_rendering_is_deterministic() {
    assert_eq!(
        render_dockerfile(&pinned_plan()),
        render_dockerfile(&pinned_plan())
    );
}

#[tokio::test]
async fn test_resolved_pin_round_trips_through_the_fake_registry() {
    let remote = FakeRemote::new();
    let plan = pinned_plan();
    // A plan pinned to the registry's own digest still resolves.
    let digest = remote.resolve_image(&plan.image).await.unwrap();
    assert_eq!(Some(digest), plan.image.digest);
}
