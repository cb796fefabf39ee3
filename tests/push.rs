/*
 * Copyright 2024 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::Arc;

use pretty_assertions::assert_eq;

use meshgen::{
    model::{DefaultEnvironment, Protocol},
    test, ConfigGenerator, MeshConfig, PushContext, SharedPushContext,
};

#[tokio::test]
async fn push_all_builds_every_proxy_against_one_snapshot() {
    let db = test::service("db.default.svc", "10.2.0.9", &[("tcp", 3306, Protocol::Tcp)]);
    let web = test::service("web.default.svc", "10.2.0.10", &[("http", 8080, Protocol::Http)]);
    let proxies: Vec<_> = (1..=8)
        .map(|i| {
            let ip = format!("10.0.0.{i}");
            Arc::new(test::proxy(&format!("proxy-{i}"), &[&ip], vec![db.clone(), web.clone()]))
        })
        .collect();

    let shared = SharedPushContext::new(PushContext::default());
    let snapshot = shared.load();
    let generator = ConfigGenerator::default();

    let results = generator.push_all(&shared, proxies.clone()).await.unwrap();

    assert_eq!(proxies.len(), results.len());
    for (proxy, result) in proxies.iter().zip(&results) {
        assert_eq!(proxy.id, result.proxy_id);
        assert_eq!(snapshot.version, result.version);
        assert_eq!(generator.build_listeners(proxy, &snapshot), result.listeners);
    }
}

#[tokio::test]
async fn push_all_sees_stored_settings() {
    let shared = SharedPushContext::new(PushContext::default());
    let proxy = Arc::new(test::proxy("a", &["10.0.0.1"], vec![]));
    let generator = ConfigGenerator::default();

    let before = generator.push_all(&shared, vec![proxy.clone()]).await.unwrap();
    assert!(!before[0].listeners.is_empty());

    let mesh = MeshConfig {
        proxy_listen_port: 0,
        ..<_>::default()
    };
    shared.store(Arc::new(mesh), Arc::new(DefaultEnvironment::default()));

    let after = generator.push_all(&shared, vec![proxy]).await.unwrap();
    assert!(after[0].listeners.is_empty());
    assert_ne!(before[0].version, after[0].version);
}

#[tokio::test]
async fn push_all_without_proxies() {
    let shared = SharedPushContext::new(PushContext::default());
    let results = ConfigGenerator::default()
        .push_all(&shared, Vec::new())
        .await
        .unwrap();
    assert!(results.is_empty());
}
