use std::sync::Arc;

use divan::Bencher;
use meshgen::{
    model::{Protocol, Proxy, Service},
    test, ConfigGenerator, PushContext,
};

const SERVICE_COUNTS: &[usize] = &[10, 100, 1000];

/// A proxy seeing `N` services, a third each on shared HTTP, shared TCP
/// range and dedicated TCP VIP ports.
fn gen_proxy<const N: usize>() -> Proxy {
    let services: Vec<Arc<Service>> = (0..N)
        .map(|i| {
            let hostname = format!("svc-{i}.default.svc");
            let (octet, low) = ((i / 250) % 250, i % 250);
            match i % 3 {
                0 => test::service(
                    &hostname,
                    &format!("10.1.{octet}.{low}"),
                    &[("http", 8080, Protocol::Http)],
                ),
                1 => test::service(
                    &hostname,
                    &format!("10.{}.0.0/24", 10 + i % 200),
                    &[("tcp", 5432, Protocol::Tcp)],
                ),
                _ => test::service(
                    &hostname,
                    &format!("10.2.{octet}.{low}"),
                    &[("tcp", 3306, Protocol::Tcp), ("grpc", 9090, Protocol::Grpc)],
                ),
            }
        })
        .collect();

    let mut proxy = test::proxy("bench", &["10.0.0.1"], services.clone());
    proxy.service_instances = services
        .iter()
        .take(3)
        .filter(|service| service.ports.get_by_name("http").is_some())
        .map(|service| test::instance(service, "10.0.0.1", "http"))
        .collect();
    proxy
}

#[divan::bench_group(sample_count = 10)]
mod build {
    use super::*;

    #[divan::bench(consts = SERVICE_COUNTS)]
    fn listeners<const N: usize>(b: Bencher) {
        let proxy = gen_proxy::<N>();
        let push = PushContext::default();
        let generator = ConfigGenerator::default();

        b.counter(N)
            .bench(|| divan::black_box(generator.build_listeners(&proxy, &push)));
    }

    #[divan::bench(consts = SERVICE_COUNTS)]
    fn serialize<const N: usize>(b: Bencher) {
        let proxy = gen_proxy::<N>();
        let push = PushContext::default();
        let listeners = ConfigGenerator::default().build_listeners(&proxy, &push);

        b.counter(listeners.len())
            .bench(|| divan::black_box(serde_json::to_vec(&listeners).unwrap()));
    }
}

fn main() {
    divan::main();
}
