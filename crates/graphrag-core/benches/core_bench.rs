//! Criterion benchmarks for graphrag-core.
//!
//! ## Benchmark groups
//!
//! 1. **schema**: DDL init and replay on an initialised store.
//! 2. **swift_extraction**: Entity extraction at various file sizes.
//! 3. **manifest**: Manifest parsing and file → module resolution.
//! 4. **store**: `apply_commit` throughput and `query_current` latency.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/graphrag-core/Cargo.toml
//! # Run only the store group:
//! cargo bench --manifest-path crates/graphrag-core/Cargo.toml -- store
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rusqlite::Connection;

use graphrag_core::indexer::filesystem::content_hash;
use graphrag_core::indexer::manifest::{BuildSystem, ModuleIndex};
use graphrag_core::indexer::swift::extract_swift;
use graphrag_core::models::{CommitBatch, FileFacts, ModuleInfo, QueryFilter};
use graphrag_core::store::database::EntityStore;
use graphrag_core::store::schema::{init_schema, schema_version};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const SWIFT_SOURCE: &str = r#"
import Foundation

/// Holds the items a customer is about to buy.
public final class Cart: ObservableObject, Codable {
    public private(set) var items: [LineItem] = []
    private let pricing: PricingService

    public init(pricing: PricingService) {
        self.pricing = pricing
    }

    public func add(_ item: LineItem) {
        items.append(item)
    }

    public var total: Decimal {
        items.reduce(0) { $0 + pricing.price(for: $1) }
    }

    static func empty() -> Cart { Cart(pricing: .standard) }
}

public struct LineItem: Hashable {
    let sku: String
    let quantity: Int

    enum Kind: String {
        case physical
        case digital = "digital"
    }
}

protocol PricingService {
    associatedtype Currency
    func price(for item: LineItem) -> Decimal
}

extension Cart: CustomStringConvertible {
    public var description: String { "Cart(\(items.count))" }
}

actor CheckoutQueue {
    private var pending: [Cart] = []
    func enqueue(_ cart: Cart) { pending.append(cart) }
}
"#;

const TUIST_PROJECT: &str = r#"
import ProjectDescription

let project = Project(
    name: "Shop",
    targets: [
        Target(name: "Shop", product: .app, sources: ["Targets/Shop/Sources/**"]),
        Target(name: "ShopKit", product: .framework, sources: ["Targets/ShopKit/Sources/**"]),
        Target(name: "ShopTests", product: .unitTests, sources: ["Targets/Shop/Tests/**"]),
    ]
)
"#;

/// `SWIFT_SOURCE` repeated `copies` times with renamed top-level types.
fn swift_source(copies: usize) -> String {
    (0..copies)
        .map(|i| {
            SWIFT_SOURCE
                .replace("Cart", &format!("Cart{i}"))
                .replace("LineItem", &format!("LineItem{i}"))
                .replace("PricingService", &format!("PricingService{i}"))
                .replace("CheckoutQueue", &format!("CheckoutQueue{i}"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn file_facts(index: usize, revision: usize) -> FileFacts {
    let path = format!("Sources/Feature{index}/Cart{index}.swift");
    let source = SWIFT_SOURCE.replace("Cart", &format!("Cart{index}r{revision}"));
    FileFacts {
        content_hash: content_hash(source.as_bytes()),
        entities: extract_swift(&path, &source).unwrap(),
        module: ModuleInfo::unresolved(format!("Feature{index}")),
        path,
    }
}

fn batch(commit: &str, files: usize, revision: usize) -> CommitBatch {
    let mut batch = CommitBatch::new(commit);
    batch.files = (0..files).map(|i| file_facts(i, revision)).collect();
    batch.touched = batch.files.iter().map(|f| f.path.clone()).collect();
    batch
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

fn bench_schema_init(c: &mut Criterion) {
    let mut group = c.benchmark_group("schema");

    group.bench_function("init_in_memory", |b| {
        b.iter(|| {
            let conn = Connection::open_in_memory().unwrap();
            conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
            init_schema(black_box(&conn)).unwrap();
        });
    });

    group.bench_function("replay_existing", |b| {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        b.iter(|| {
            init_schema(black_box(&conn)).unwrap();
            black_box(schema_version(&conn).unwrap());
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Swift extraction
// ---------------------------------------------------------------------------

fn bench_swift_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("swift_extraction");

    for copies in [1usize, 10, 50].iter() {
        let source = swift_source(*copies);
        group.bench_with_input(BenchmarkId::new("extract", copies), &source, |b, source| {
            b.iter(|| {
                let entities = extract_swift("Sources/Shop/Cart.swift", black_box(source)).unwrap();
                black_box(entities);
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

fn bench_manifest(c: &mut Criterion) {
    let mut group = c.benchmark_group("manifest");

    group.bench_function("parse_tuist_project", |b| {
        b.iter(|| {
            BuildSystem::Tuist
                .parse_manifest("Project.swift", "", black_box(TUIST_PROJECT))
                .unwrap()
        });
    });

    let modules = BuildSystem::Tuist
        .parse_manifest("Project.swift", "", TUIST_PROJECT)
        .unwrap();
    let index = ModuleIndex::from_modules(modules);
    let paths: Vec<String> = (0..200)
        .map(|i| match i % 4 {
            0 => format!("Targets/Shop/Sources/Screen{i}.swift"),
            1 => format!("Targets/ShopKit/Sources/Model/Type{i}.swift"),
            2 => format!("Targets/Shop/Tests/Screen{i}Tests.swift"),
            _ => format!("Scripts/Tool{i}.swift"),
        })
        .collect();

    group.bench_function("resolve_200_paths", |b| {
        b.iter(|| {
            for path in &paths {
                black_box(index.resolve(black_box(path)));
            }
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");
    group.sample_size(20);

    for files in [10usize, 100].iter() {
        group.bench_with_input(
            BenchmarkId::new("apply_commit", files),
            files,
            |b, &files| {
                let dir = tempfile::tempdir().unwrap();
                let store = EntityStore::open(dir.path().join("bench.db")).unwrap();
                let mut revision = 0usize;
                b.iter(|| {
                    revision += 1;
                    let batch = batch(&format!("c{revision}"), files, revision);
                    black_box(store.apply_commit(&batch).unwrap());
                });
            },
        );
    }

    let dir = tempfile::tempdir().unwrap();
    let store = EntityStore::open(dir.path().join("query.db")).unwrap();
    for revision in 0..5 {
        store
            .apply_commit(&batch(&format!("c{revision}"), 200, revision))
            .unwrap();
    }
    let reader = store.reader();

    group.bench_function("query_current/name_substring", |b| {
        let filter = QueryFilter {
            name: Some("Cart1".into()),
            limit: 25,
            ..Default::default()
        };
        b.iter(|| black_box(reader.query_current(black_box(&filter)).unwrap()));
    });

    group.bench_function("query_current/kind_with_members", |b| {
        let filter = QueryFilter {
            kind: Some("class".into()),
            limit: 25,
            include_members: true,
            ..Default::default()
        };
        b.iter(|| black_box(reader.query_current(black_box(&filter)).unwrap()));
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Register all benchmark groups
// ---------------------------------------------------------------------------

criterion_group!(
    benches,
    bench_schema_init,
    bench_swift_extraction,
    bench_manifest,
    bench_store,
);
criterion_main!(benches);
