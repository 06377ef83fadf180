//! Garbage collector behavior, observed through `Vm::heap_stats`.

use skald::{CollectStringPrint, NoPrint, Vm, VmConfig, compile};

/// A config with a small initial watermark so tests trigger collections
/// quickly.
fn small_heap() -> VmConfig {
    VmConfig {
        heap_initial: 16 * 1024,
        ..VmConfig::default()
    }
}

fn run_collecting(source: &str, config: VmConfig) -> (Vm<CollectStringPrint>, String) {
    let program = compile(source, "gc_test").expect("program should compile");
    let mut vm = Vm::with_writer(config, CollectStringPrint::new());
    vm.run(&program).expect("program should run");
    let output = vm.writer().output().to_owned();
    (vm, output)
}

#[test]
fn short_lived_garbage_is_collected() {
    // Each iteration allocates strings that become garbage immediately.
    let source = "
        for i in 1 to 20000 do
            let s = \"x\" + str(i)
        end
        print(\"done\")
    ";
    let (vm, output) = run_collecting(source, small_heap());
    assert_eq!(output, "done\n");
    let stats = vm.heap_stats();
    assert!(stats.collections > 0, "the watermark should have triggered: {stats:?}");
    // Everything allocated in the loop was garbage; the live count must not
    // scale with the iteration count.
    assert!(
        stats.live_objects < 1000,
        "heap should have stabilized, got {} live objects",
        stats.live_objects
    );
}

#[test]
fn reachable_objects_survive_collection_stress() {
    // The GC stress scenario: a million short-lived strings while a global
    // array keeps 100 strings reachable the whole time.
    let source = "
        let keep = []
        for i in 1 to 100 do
            push(keep, \"keep-\" + str(i))
        end
        for round in 1 to 200000 do
            let a = \"junk-\" + str(round)
            let b = a + \"!\"
            let c = b + \"?\"
            let d = [a, b]
            let e = {\"k\": c}
        end
        let ok = true
        for i in 1 to 100 do
            if keep[i - 1] != \"keep-\" + str(i) then ok = false end
        end
        print(ok, len(keep))
    ";
    let (vm, output) = run_collecting(source, small_heap());
    assert_eq!(output, "true 100\n");
    let stats = vm.heap_stats();
    assert!(stats.collections > 1, "stress loop must collect repeatedly: {stats:?}");
    assert!(
        stats.live_objects < 2000,
        "heap must stabilize while keeping survivors, got {} live objects",
        stats.live_objects
    );
}

#[test]
fn cyclic_structures_are_collected() {
    // Arrays that reference each other are unreachable garbage once the
    // binding goes away; reference counting could never free these.
    let source = "
        fn churn()
            for i in 1 to 5000 do
                let a = [nil]
                let b = [a]
                a[0] = b
            end
        end
        churn()
        print(\"done\")
    ";
    let (vm, output) = run_collecting(source, small_heap());
    assert_eq!(output, "done\n");
    let stats = vm.heap_stats();
    assert!(
        stats.live_objects < 1000,
        "cycles must be collected, got {} live objects",
        stats.live_objects
    );
}

#[test]
fn closed_upvalues_keep_captured_values_alive() {
    let source = "
        fn make()
            let secret = \"captured-\" + str(12345)
            return fn () -> secret
        end
        let f = make()
        for i in 1 to 20000 do
            let junk = \"junk-\" + str(i)
        end
        print(f())
    ";
    let (vm, output) = run_collecting(source, small_heap());
    assert_eq!(output, "captured-12345\n");
    assert!(vm.heap_stats().collections > 0);
}

#[test]
fn interned_strings_are_weak() {
    // A transient string's intern entry must not keep it alive: after heavy
    // churn the table should stay near the live-string count.
    let source = "
        for i in 1 to 30000 do
            let s = str(i) + \"-transient\"
        end
        print(\"done\")
    ";
    let (vm, output) = run_collecting(source, small_heap());
    assert_eq!(output, "done\n");
    let stats = vm.heap_stats();
    let strings = stats.objects_by_type.get("Str").copied().unwrap_or(0);
    assert!(
        stats.interned_strings <= strings,
        "intern table ({}) must not exceed live strings ({strings})",
        stats.interned_strings
    );
}

#[test]
fn watermark_grows_with_the_live_set() {
    let source = "
        let keep = []
        for i in 1 to 2000 do
            push(keep, \"payload-\" + str(i))
        end
        print(len(keep))
    ";
    let (vm, output) = run_collecting(source, small_heap());
    assert_eq!(output, "2000\n");
    let stats = vm.heap_stats();
    assert!(
        stats.next_gc >= stats.bytes_allocated,
        "watermark must sit above the live set: {stats:?}"
    );
}

#[test]
fn heap_diff_shows_what_a_run_allocated() {
    let mut vm: Vm<NoPrint> = Vm::with_writer(VmConfig::default(), NoPrint);
    let before = vm.heap_stats();
    let program = compile("let data = [\"a\", \"b\"]", "diff").expect("compiles");
    vm.run(&program).expect("runs");
    let diff = before.diff(&vm.heap_stats());
    assert!(diff.live_objects_delta >= 3, "array plus two strings: {diff}");
    assert!(diff.new_types.contains(&"Array"), "{diff}");
    assert!(diff.new_types.contains(&"Str"), "{diff}");
}

#[test]
fn heap_is_empty_before_first_run() {
    let vm: Vm<NoPrint> = Vm::with_writer(VmConfig::default(), NoPrint);
    let stats = vm.heap_stats();
    assert_eq!(stats.live_objects, 0);
    assert_eq!(stats.interned_strings, 0);
    assert_eq!(stats.collections, 0);
}
