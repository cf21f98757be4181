use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::Rng;

use cavity_retreat::controller::{Controller, ControllerSettings};

fn searching_controller() -> Controller {
    let mut ctrl = Controller::new(ControllerSettings::default()).unwrap();
    for _ in 0..100 {
        ctrl.observe(400.0);
    }
    ctrl.arm_lock().unwrap();
    ctrl.request_lock();
    ctrl
}

pub fn control_tick(c: &mut Criterion) {
    c.bench_function("tick while searching", |b| {
        let mut ctrl = searching_controller();
        let mut rng = rand::thread_rng();
        b.iter(|| {
            ctrl.observe(rng.gen_range(100.0..150.0));
            black_box(ctrl.tick(Instant::now()));
        });
    });
}

pub fn interpreter(c: &mut Criterion) {
    let requests = [
        "SetVolt3 4.2",
        "CheckVolt 3",
        "ShiftVolt5 Up",
        "Check Lock",
        "banana",
        "Please Dance",
    ];
    c.bench_function("process_command", |b| {
        let mut ctrl = searching_controller();
        b.iter(|| {
            for request in requests {
                black_box(ctrl.process_command(black_box(request)));
            }
        });
    });
}

criterion_group!(benches, control_tick, interpreter);
criterion_main!(benches);
