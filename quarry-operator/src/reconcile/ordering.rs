//! Controller ordering.
//!
//! A fresh deployment brings the frontend tier up first so that dependent tiers can resolve its
//! address. An upgrade rolls the data & compute tiers before the coordination tier.

use quarry_core::crd::{ClusterPhase, ClusterSpec};
use quarry_core::TierKind;

use super::workload::LiveWorkloads;

/// The tiers consulted, in order, when deciding whether a pass is an upgrade.
const UPGRADE_CHECK_ORDER: [TierKind; 3] = [TierKind::Backend, TierKind::Compute, TierKind::Frontend];

/// The shape of a convergence pass, which determines controller order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scenario {
    FreshDeploy,
    Upgrade,
}

/// Detect the scenario of a pass from the observed phase & live workloads.
///
/// The first tier in check order which has both a live workload & a desired spec is compared: a
/// running cluster whose live image differs from the desired image is being upgraded.
///
/// Each tier's live image is compared against that same tier's desired image, never against the
/// frontend's. Tiers declare their own images, so a converged backend at `be:v1` is not an
/// upgrade just because the frontend declares `fe:v2`.
pub fn detect_scenario(phase: ClusterPhase, live: &LiveWorkloads, desired: &ClusterSpec) -> Scenario {
    if phase != ClusterPhase::Running {
        return Scenario::FreshDeploy;
    }
    let compared = UPGRADE_CHECK_ORDER.iter().find_map(|tier| {
        let live_image = live.get(tier)?.image.as_deref()?;
        let desired_image = desired.tier(*tier)?.image.as_str();
        Some((live_image, desired_image))
    });
    match compared {
        Some((live_image, desired_image)) if live_image != desired_image => Scenario::Upgrade,
        _ => Scenario::FreshDeploy,
    }
}

/// The order in which tier controllers run for the given scenario.
pub fn order_for(scenario: Scenario) -> [TierKind; 4] {
    match scenario {
        Scenario::FreshDeploy => [TierKind::Frontend, TierKind::Backend, TierKind::Compute, TierKind::Proxy],
        Scenario::Upgrade => [TierKind::Backend, TierKind::Compute, TierKind::Frontend, TierKind::Proxy],
    }
}
