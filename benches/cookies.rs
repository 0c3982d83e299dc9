use criterion::{black_box, criterion_group, criterion_main, Criterion};
use url::Url;
use wirenet::cookies::CookieJar;

fn benchmark_cookies(c: &mut Criterion) {
    let url = Url::parse("https://www.example.com/account/settings").unwrap();

    c.bench_function("cookie_set", |b| {
        let jar = CookieJar::new();
        b.iter(|| black_box(jar.set_cookie("sid=abc123; Path=/; Secure; HttpOnly", &url)))
    });

    let jar = CookieJar::new();
    for i in 0..40 {
        jar.set_cookie(&format!("c{i}=v{i}; Domain=example.com; Path=/"), &url);
    }
    jar.set_cookie("deep=1; Path=/account", &url);

    c.bench_function("cookie_header_for_url", |b| {
        b.iter(|| black_box(jar.cookie_header_for_url(&url)))
    });
}

criterion_group!(benches, benchmark_cookies);
criterion_main!(benches);
