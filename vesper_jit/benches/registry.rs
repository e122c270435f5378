//! Registry lookup benchmark: the walker performs one lookup per native
//! frame, on paths that may sit under an in-flight exception.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use vesper_core::{SourceFunction, SourceModule};
use vesper_jit::unwind::{
    code_registry, object_emitted, set_pending_compilation, CompiledCode, EmittedObject,
    SectionInfo,
};

/// One CIE + one FDE, contents irrelevant to registration.
fn eh_frame_bytes() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0x10u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend(std::iter::repeat(0).take(0x10 - 4));
    out.extend_from_slice(&0x18u32.to_le_bytes());
    out.extend(std::iter::repeat(0).take(0x18));
    out
}

fn emit(name: &str, text_addr: u64, module: &Arc<SourceModule>) {
    let code = CompiledCode::new(
        SourceFunction::new(name, Arc::clone(module), Vec::new()),
        None,
    );
    set_pending_compilation(code);
    let eh = eh_frame_bytes();
    let obj = EmittedObject {
        sections: vec![
            SectionInfo {
                name: ".text".into(),
                addr: text_addr,
                size: 0x100,
            },
            SectionInfo {
                name: ".eh_frame".into(),
                addr: eh.as_ptr() as u64,
                size: eh.len() as u64,
            },
        ],
    };
    object_emitted(&obj).expect("emission failed");
}

fn bench_lookup(c: &mut Criterion) {
    let module = SourceModule::new("bench", "bench.vsp");
    for i in 0..64u64 {
        emit(&format!("f{i}"), 0x10_0000 + i * 0x100, &module);
    }

    c.bench_function("registry_lookup_hit", |b| {
        b.iter(|| code_registry().lookup(black_box(0x10_2040)))
    });
    c.bench_function("registry_lookup_miss", |b| {
        b.iter(|| code_registry().lookup(black_box(0xdead_beef)))
    });
}

criterion_group!(benches, bench_lookup);
criterion_main!(benches);
