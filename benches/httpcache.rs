use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use http::{HeaderMap, HeaderValue, StatusCode};
use url::Url;
use wirenet::http::HttpCache;

fn benchmark_cache(c: &mut Criterion) {
    let mut response_headers = HeaderMap::new();
    response_headers.insert("cache-control", HeaderValue::from_static("max-age=300"));
    response_headers.insert("vary", HeaderValue::from_static("Accept-Encoding"));
    let mut request_headers = HeaderMap::new();
    request_headers.insert("accept-encoding", HeaderValue::from_static("gzip"));
    let body = Bytes::from(vec![b'x'; 2048]);

    let urls: Vec<Url> = (0..256)
        .map(|i| Url::parse(&format!("https://example.com/page/{i}")).unwrap())
        .collect();

    c.bench_function("cache_put_256", |b| {
        b.iter(|| {
            let cache = HttpCache::with_limits(128, 1024 * 1024);
            for url in &urls {
                black_box(cache.put(url, &request_headers, StatusCode::OK, &response_headers, body.clone()));
            }
        })
    });

    let cache = HttpCache::new();
    for url in &urls {
        cache.put(url, &request_headers, StatusCode::OK, &response_headers, body.clone());
    }

    c.bench_function("cache_get_hit", |b| {
        b.iter(|| black_box(cache.get(&urls[17], &request_headers)))
    });

    let other = HeaderMap::new();
    c.bench_function("cache_get_vary_miss", |b| {
        b.iter(|| black_box(cache.get(&urls[17], &other)))
    });
}

criterion_group!(benches, benchmark_cache);
criterion_main!(benches);
