use dwarfstep::{arch, CacheConfig, LocalAddressSpace, Unwinder};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::DEBUG.into())
            .from_env()
            .unwrap(),
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    let unwinder = Unwinder::new(LocalAddressSpace::new(), CacheConfig::default());
    for _ in 0..2 {
        uwu(&unwinder, 3);
    }

    if let Some(stats) = unwinder.cache_stats() {
        tracing::info!(?stats, "done");
    }
}

#[inline(never)]
fn uwu(unwinder: &Unwinder<LocalAddressSpace>, depth: usize) {
    if depth == 0 {
        walk(unwinder);
    } else {
        uwu(unwinder, depth - 1);
    }
    std::hint::black_box(depth);
}

#[inline(never)]
fn walk(unwinder: &Unwinder<LocalAddressSpace>) {
    let mut context = arch::capture_context();
    let mut cursor = unwinder.cursor(&mut context).unwrap();
    let mut name = [0; 128];

    loop {
        let ip = cursor.ip();
        match cursor.proc_name(&mut name) {
            Ok((len, offset)) => {
                let name = String::from_utf8_lossy(&name[..len]);
                tracing::info!("{ip:#x} {name}+{offset:#x}");
            }
            Err(_) => tracing::info!("{ip:#x} <unknown>"),
        }

        match cursor.step() {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                tracing::error!("stopped walking: {err}");
                break;
            }
        }
    }
}
