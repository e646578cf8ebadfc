use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use swarm_conformance::{
    composition::{
        composition_types::{Granularity, InterfacingProtocols},
        exact_well_formed_sub, overapproximated_well_formed_sub, project,
    },
    types::{Command, EventType, Role, State, SwarmLabel, Transition},
    Subscriptions, SwarmProtocolType,
};
use tracing_subscriber::{fmt, fmt::format::FmtSpan, EnvFilter};

fn setup_logger() {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
        .try_init()
        .ok();
}

fn label(role: &str, name: &str) -> SwarmLabel {
    SwarmLabel {
        cmd: Command::new(&format!("{name}_cmd")),
        log_type: vec![EventType::new(name)],
        role: Role::new(role),
    }
}

fn transition(source: usize, target: usize, label: SwarmLabel) -> Transition<SwarmLabel> {
    Transition {
        label,
        source: State::new(&source.to_string()),
        target: State::new(&target.to_string()),
    }
}

// Protocol i runs a small loop with a choice bracketed by the interface it shares with
// protocol i + 1, and is itself bracketed by the interface shared with protocol i - 1.
fn nested_protocol(i: usize) -> SwarmProtocolType {
    let inner = format!("IR{i}");
    let worker = format!("W{i}");
    let mut transitions = vec![
        transition(1, 2, label(&inner, &format!("{inner}_start"))),
        transition(2, 3, label(&worker, &format!("{worker}_a"))),
        transition(3, 2, label(&worker, &format!("{worker}_b"))),
        transition(2, 4, label(&worker, &format!("{worker}_c"))),
        transition(4, 5, label(&inner, &format!("{inner}_end"))),
    ];
    let initial = if i == 0 {
        1
    } else {
        let outer = format!("IR{}", i - 1);
        transitions.push(transition(0, 1, label(&outer, &format!("{outer}_start"))));
        transitions.push(transition(5, 6, label(&outer, &format!("{outer}_end"))));
        0
    };
    SwarmProtocolType {
        initial: State::new(&initial.to_string()),
        transitions,
    }
}

fn inputs() -> Vec<(usize, InterfacingProtocols)> {
    (1..=4)
        .map(|n| (n, InterfacingProtocols((0..n).map(nested_protocol).collect())))
        .collect()
}

fn bench_subscriptions(c: &mut Criterion) {
    setup_logger();
    let mut group = c.benchmark_group("subscriptions");
    group.sample_size(10);
    let subs = Subscriptions::new();

    for (size, protos) in inputs() {
        group.bench_with_input(BenchmarkId::new("exact", size), &protos, |b, input| {
            b.iter(|| exact_well_formed_sub(input.clone(), &subs))
        });
        group.bench_with_input(BenchmarkId::new("two-step", size), &protos, |b, input| {
            b.iter(|| overapproximated_well_formed_sub(input.clone(), &subs, Granularity::TwoStep))
        });
    }
    group.finish();
}

fn bench_projection(c: &mut Criterion) {
    setup_logger();
    let mut group = c.benchmark_group("projection");
    group.sample_size(10);

    for (size, protos) in inputs() {
        let Ok(subs) = exact_well_formed_sub(protos.clone(), &Subscriptions::new()) else {
            continue;
        };
        group.bench_with_input(BenchmarkId::new("minimized", size), &protos, |b, input| {
            b.iter(|| project(input.clone(), &subs, Role::new("W0"), true))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_subscriptions, bench_projection);
criterion_main!(benches);
