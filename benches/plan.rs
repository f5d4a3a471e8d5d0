use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use probeplan::classfile;
use probeplan::{
    BytecodeEditor, ClassRecord, EditedMethod, EditorVeto, InjKind, LoadSnapshot, NullProvider,
    Planner, PlannerSettings, RootSet,
};

fn u2(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn u4(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn utf8(out: &mut Vec<u8>, s: &str) {
    out.push(1);
    u2(out, s.len() as u16);
    out.extend_from_slice(s.as_bytes());
}

/// `bench/Work` with one `run()V` method of a few instructions.
fn build_bench_class() -> Vec<u8> {
    let mut bytes = Vec::new();
    u4(&mut bytes, 0xCAFEBABE);
    u2(&mut bytes, 0);
    u2(&mut bytes, 52);

    u2(&mut bytes, 9); // constant pool count
    utf8(&mut bytes, "bench/Work"); // 1
    utf8(&mut bytes, "java/lang/Object"); // 2
    bytes.push(7); // 3: Class #1
    u2(&mut bytes, 1);
    bytes.push(7); // 4: Class #2
    u2(&mut bytes, 2);
    utf8(&mut bytes, "run"); // 5
    utf8(&mut bytes, "()V"); // 6
    utf8(&mut bytes, "Code"); // 7
    utf8(&mut bytes, "StackMapTable"); // 8

    u2(&mut bytes, 0x0021); // access_flags
    u2(&mut bytes, 3); // this_class
    u2(&mut bytes, 4); // super_class
    u2(&mut bytes, 0); // interfaces
    u2(&mut bytes, 0); // fields

    u2(&mut bytes, 1); // methods
    u2(&mut bytes, 0x0001);
    u2(&mut bytes, 5); // name: run
    u2(&mut bytes, 6); // descriptor: ()V
    u2(&mut bytes, 1); // one attribute
    let code = [0x00, 0x00, 0x00, 0xb1];
    u2(&mut bytes, 7); // Code
    u4(&mut bytes, (12 + code.len()) as u32);
    u2(&mut bytes, 2); // max_stack
    u2(&mut bytes, 1); // max_locals
    u4(&mut bytes, code.len() as u32);
    bytes.extend_from_slice(&code);
    u2(&mut bytes, 0); // exception_table_length
    u2(&mut bytes, 0); // no sub-attributes

    u2(&mut bytes, 0); // class attributes

    bytes
}

struct PassThroughEditor;

impl BytecodeEditor for PassThroughEditor {
    fn instrument(
        &mut self,
        class: &mut ClassRecord,
        method_idx: usize,
        _kind: InjKind,
        _method_id: u16,
    ) -> Result<EditedMethod, EditorVeto> {
        Ok(EditedMethod {
            method_info: class.orig_method_info(method_idx).to_vec(),
            appended_cp_entries: 0,
        })
    }
}

fn bench_classfile_parse(c: &mut Criterion) {
    let bytes = build_bench_class();
    c.bench_function("classfile_parse", |b| {
        b.iter(|| {
            let _ = classfile::parse("bench/Work", &bytes).unwrap();
        })
    });
}

fn bench_on_class_load(c: &mut Criterion) {
    let bytes = build_bench_class();
    c.bench_function("on_class_load", |b| {
        b.iter_batched(
            || {
                let mut planner = Planner::new(
                    Box::new(NullProvider),
                    Box::new(PassThroughEditor),
                    PlannerSettings::default(),
                );
                planner.repository_mut().seed_class_bytes("bench/Work", 0, bytes.clone());
                let mut roots = RootSet::new();
                roots.add_root("bench/*", "*", "");
                planner.initial(&LoadSnapshot::default(), roots);
                planner
            },
            |mut planner| planner.on_class_load("bench/Work", 0),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_classfile_parse, bench_on_class_load);
criterion_main!(benches);
