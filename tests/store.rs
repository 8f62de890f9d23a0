//! Row store behaviors: persistence across reopen, list filters,
//! reference checks, and the proxy's hostname lookup.

use chrono::Utc;
use serde_json::json;

use hoster::store::EntityRow;
use hoster::store::db::{Db, ListFilter};
use hoster::store::entities::{self, DEPLOYMENTS, TEMPLATES};

fn row(id: &str, owner: &str, status: &str, attributes: serde_json::Value) -> EntityRow {
    let now = Utc::now();
    EntityRow {
        id: id.to_string(),
        owner_id: owner.to_string(),
        status: status.to_string(),
        created_at: now,
        updated_at: now,
        attributes: attributes.as_object().unwrap().clone(),
    }
}

#[tokio::test]
async fn rows_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hoster.db");
    let schemas = entities::registry();

    {
        let db = Db::open(&path, &schemas).await.unwrap();
        db.insert(
            TEMPLATES,
            &row("t-1", "creator-1", "active", json!({"name": "app", "slug": "app"})),
        )
        .await
        .unwrap();
    }

    let db = Db::open(&path, &schemas).await.unwrap();
    let found = db.fetch(TEMPLATES, "t-1").await.unwrap().unwrap();
    assert_eq!(found.owner_id, "creator-1");
    assert_eq!(found.attr_str("slug"), Some("app"));
}

#[tokio::test]
async fn hostname_lookup_is_case_insensitive() {
    let schemas = entities::registry();
    let db = Db::open_in_memory(&schemas).await.unwrap();

    db.insert(
        DEPLOYMENTS,
        &row(
            "d-1",
            "cust-1",
            "running",
            json!({
                "proxy_port": 30001,
                "domains": [
                    {"hostname": "blog-x7k2m9.Apps.Example.com", "type": "auto", "ssl": false, "verified": true},
                    {"hostname": "www.customer.net", "type": "custom", "ssl": true, "verified": false}
                ]
            }),
        ),
    )
    .await
    .unwrap();

    let hit = db
        .find_deployment_by_hostname("BLOG-X7K2M9.apps.example.COM")
        .await
        .unwrap();
    assert_eq!(hit.unwrap().id, "d-1");

    // Any entry matches, not just the generated one.
    let custom = db
        .find_deployment_by_hostname("WWW.customer.net")
        .await
        .unwrap();
    assert_eq!(custom.unwrap().id, "d-1");

    let miss = db
        .find_deployment_by_hostname("other.apps.example.com")
        .await
        .unwrap();
    assert!(miss.is_none());
}

#[tokio::test]
async fn deleted_deployments_do_not_route() {
    let schemas = entities::registry();
    let db = Db::open_in_memory(&schemas).await.unwrap();

    db.insert(
        DEPLOYMENTS,
        &row(
            "d-1",
            "cust-1",
            "deleted",
            json!({"domains": [{"hostname": "gone.apps.example.com", "type": "auto", "ssl": false, "verified": true}]}),
        ),
    )
    .await
    .unwrap();

    let miss = db
        .find_deployment_by_hostname("gone.apps.example.com")
        .await
        .unwrap();
    assert!(miss.is_none());
}

#[tokio::test]
async fn list_filters_compose() {
    let schemas = entities::registry();
    let db = Db::open_in_memory(&schemas).await.unwrap();

    for (id, owner, status, published) in [
        ("t-1", "creator-1", "active", true),
        ("t-2", "creator-1", "active", false),
        ("t-3", "creator-2", "active", true),
        ("t-4", "creator-2", "deleted", true),
    ] {
        db.insert(
            TEMPLATES,
            &row(id, owner, status, json!({"published": published})),
        )
        .await
        .unwrap();
    }

    // Owner-only.
    let mine = db
        .list(TEMPLATES, &ListFilter {
            owner: Some("creator-1".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(mine.len(), 2);

    // Public flag only (anonymous browsing).
    let published = db
        .list(TEMPLATES, &ListFilter {
            public_flag: Some("published"),
            status: Some("active".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let ids: Vec<&str> = published.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["t-1", "t-3"]);

    // Owner or public.
    let visible = db
        .list(TEMPLATES, &ListFilter {
            owner: Some("creator-1".into()),
            public_flag: Some("published"),
            status: Some("active".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(visible.len(), 3);

    // Cursor pagination walks id order.
    let page = db
        .list(TEMPLATES, &ListFilter {
            cursor: Some("t-2".into()),
            limit: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page[0].id, "t-3");
}

#[tokio::test]
async fn reference_checks_skip_excluded_statuses() {
    let schemas = entities::registry();
    let db = Db::open_in_memory(&schemas).await.unwrap();

    db.insert(
        DEPLOYMENTS,
        &row("d-1", "cust-1", "deleted", json!({"template_id": "t-1"})),
    )
    .await
    .unwrap();
    assert!(
        !db.has_reference(DEPLOYMENTS, "template_id", "t-1", &["deleted"])
            .await
            .unwrap()
    );

    db.insert(
        DEPLOYMENTS,
        &row("d-2", "cust-1", "running", json!({"template_id": "t-1"})),
    )
    .await
    .unwrap();
    assert!(
        db.has_reference(DEPLOYMENTS, "template_id", "t-1", &["deleted"])
            .await
            .unwrap()
    );

    assert_eq!(
        db.count_active(DEPLOYMENTS, "cust-1", &["deleted"]).await.unwrap(),
        1
    );
}
