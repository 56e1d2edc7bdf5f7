mod support;

use axum::http::StatusCode;
use common_audit::IpDecision;
use gpu_gateway::ip_access::{IpAccessConfig, IpMode, IpRule, RuleIp, TenantIpPolicy};
use support::{body_string, Harness, TEST_CLIENT_IP};

fn rule(ip: RuleIp, reason: Option<&str>) -> IpRule {
    IpRule { ip, active: true, expires_at: None, reason: reason.map(str::to_string), created_by: None }
}

fn denylist_policy(audit: bool) -> TenantIpPolicy {
    TenantIpPolicy {
        config: IpAccessConfig {
            mode: IpMode::Denylist,
            allowlist_enabled: false,
            denylist_enabled: true,
            block_on_no_match: false,
            audit_enabled: audit,
        },
        allow: Vec::new(),
        deny: vec![rule(RuleIp::Exact("192.0.2.7".parse().unwrap()), Some("abuse"))],
    }
}

/// Denied request carries the recorded reason and lands an audit row shortly
/// after, off the request path.
#[tokio::test]
async fn denylisted_ip_gets_403_with_reason_and_audit_row() {
    let harness = Harness::new();
    harness.policies.put(harness.tenant.id, denylist_policy(true));

    let mut request = harness.get("/api/v1/gpu/instances");
    request
        .headers_mut()
        .insert("X-Forwarded-For", "192.0.2.7".parse().unwrap());
    let response = harness.send(request).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_string(response).await;
    assert!(body.contains("abuse"), "reason missing from body: {body}");

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let records = harness.audit_store.drain();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].decision, IpDecision::Deny);
    assert_eq!(records[0].client_ip, "192.0.2.7");
    assert_eq!(records[0].reason.as_deref(), Some("abuse"));
}

#[tokio::test]
async fn unlisted_ip_passes_denylist() {
    let harness = Harness::new();
    harness.policies.put(harness.tenant.id, denylist_policy(false));
    let response = harness.send(harness.get("/api/v1/gpu/instances")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn allowlist_with_block_on_no_match_admits_only_listed() {
    let harness = Harness::new();
    harness.policies.put(
        harness.tenant.id,
        TenantIpPolicy {
            config: IpAccessConfig {
                mode: IpMode::Allowlist,
                allowlist_enabled: true,
                denylist_enabled: false,
                block_on_no_match: true,
                audit_enabled: false,
            },
            allow: vec![rule(RuleIp::Cidr("203.0.113.0/24".parse().unwrap()), None)],
            deny: Vec::new(),
        },
    );

    // TEST_CLIENT_IP sits inside 203.0.113.0/24.
    let response = harness.send(harness.get("/api/v1/gpu/instances")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut request = harness.get("/api/v1/gpu/instances");
    request
        .headers_mut()
        .insert("X-Forwarded-For", "198.51.100.20".parse().unwrap());
    let response = harness.send(request).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn audit_captures_allow_decisions_too() {
    let harness = Harness::new();
    let mut policy = denylist_policy(true);
    policy.deny.clear();
    harness.policies.put(harness.tenant.id, policy);

    let response = harness.send(harness.get("/api/v1/gpu/instances")).await;
    assert_eq!(response.status(), StatusCode::OK);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let records = harness.audit_store.drain();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].decision, IpDecision::Allow);
    assert_eq!(records[0].client_ip, TEST_CLIENT_IP);
}

/// Deny has absolute priority over allow across a spread of generated
/// configurations of the same tenant/IP pair.
#[tokio::test]
async fn denylist_priority_holds_across_generated_configs() {
    for mode in [IpMode::Denylist, IpMode::Strict] {
        for block_on_no_match in [false, true] {
            for allow_shape in ["exact", "cidr"] {
                let harness = Harness::new();
                let allow_rule = match allow_shape {
                    "exact" => rule(RuleIp::Exact("192.0.2.7".parse().unwrap()), None),
                    _ => rule(RuleIp::Cidr("192.0.2.0/24".parse().unwrap()), None),
                };
                harness.policies.put(
                    harness.tenant.id,
                    TenantIpPolicy {
                        config: IpAccessConfig {
                            mode,
                            allowlist_enabled: true,
                            denylist_enabled: true,
                            block_on_no_match,
                            audit_enabled: false,
                        },
                        allow: vec![allow_rule],
                        deny: vec![rule(
                            RuleIp::Cidr("192.0.2.0/28".parse().unwrap()),
                            Some("blocked range"),
                        )],
                    },
                );
                let mut request = harness.get("/api/v1/gpu/instances");
                request
                    .headers_mut()
                    .insert("X-Forwarded-For", "192.0.2.7".parse().unwrap());
                let response = harness.send(request).await;
                assert_eq!(
                    response.status(),
                    StatusCode::FORBIDDEN,
                    "deny must win (mode {mode:?}, block {block_on_no_match}, allow {allow_shape})"
                );
            }
        }
    }
}
