//! Scenario programs
//!
//! Each builder assembles a complete program whose `main` prints what it
//! observes and returns a summary value.

use crate::bytecode::{FunctionBuilder, ProgramBuilder};

/// `for (i = from; i < to; i++) body`; `body` must leave the stack as it found it
fn repeat(f: &mut FunctionBuilder<'_>, i: u16, from: f64, to: f64, body: impl FnOnce(&mut FunctionBuilder<'_>)) {
    let head = f.new_label();
    let done = f.new_label();
    f.number(from).set_local(i);
    f.bind(head);
    f.local(i).number(to).lt().jump_if_false(done);
    body(f);
    f.local(i).number(1.0).add().set_local(i).jump(head);
    f.bind(done);
}

/// `print(value)` where `value` is pushed by `push`
fn print(f: &mut FunctionBuilder<'_>, push: impl FnOnce(&mut FunctionBuilder<'_>)) {
    f.global("print");
    push(f);
    f.call(1).pop();
}

/// Ten single-argument functions chained by calls; only the last one computes
pub(super) fn inline_chain(b: &mut ProgramBuilder) {
    for i in 1..=10 {
        b.function(&format!("InlineFoo{}", i), 1, |f| {
            if i == 10 {
                f.local(0).number(2.0).mul().ret();
            } else {
                f.global(&format!("InlineFoo{}", i + 1)).local(0).call(1).ret();
            }
        });
    }
    b.function("BasicInlineCountTest", 0, |f| {
        let i = f.declare_local();
        let sum = f.declare_local();
        f.number(0.0).set_local(sum);
        repeat(f, i, 0.0, 10.0, |f| {
            f.local(sum).global("InlineFoo1").local(i).call(1).add().set_local(sum);
        });
        f.local(sum).ret();
    });
    b.function("main", 0, |f| {
        print(f, |f| {
            f.global("InlineFoo1").number(1.0).call(1);
        });
        print(f, |f| {
            f.global("BasicInlineCountTest").call(0);
        });
        f.global("BasicInlineCountTest").call(0).ret();
    });
}

/// Callees of exactly 45 and 46 instructions on either side of the size limit
pub(super) fn inline_boundary(b: &mut ProgramBuilder) {
    b.function("BoundaryJustUnder45Func", 1, |f| {
        f.local(0);
        for _ in 0..21 {
            f.number(1.0).add();
        }
        f.neg().ret();
    });
    b.function("BoundaryJustOver45Func", 1, |f| {
        f.local(0);
        for _ in 0..22 {
            f.number(1.0).add();
        }
        f.ret();
    });
    b.function("BoundaryTest", 0, |f| {
        let i = f.declare_local();
        let sum = f.declare_local();
        f.number(0.0).set_local(sum);
        repeat(f, i, 0.0, 10.0, |f| {
            f.local(sum)
                .global("BoundaryJustUnder45Func")
                .local(i)
                .call(1)
                .add()
                .global("BoundaryJustOver45Func")
                .local(i)
                .call(1)
                .add()
                .set_local(sum);
        });
        f.local(sum).ret();
    });
    b.function("main", 0, |f| {
        let result = f.declare_local();
        f.global("BoundaryTest").call(0).set_local(result);
        print(f, |f| {
            f.local(result);
        });
        f.local(result).ret();
    });
}

/// A prototype property changed while two compiled frames depending on it
/// are on the stack
pub(super) fn lazy_deopt(b: &mut ProgramBuilder) {
    b.function("A", 0, |f| {
        f.ret_undefined();
    });
    b.function("Init", 0, |f| {
        f.global("A").get("prototype").number(0.0).set("x").ret_undefined();
    });
    b.function("ChangePrototypeValue2", 1, |f| {
        let skip = f.new_label();
        f.local(0).jump_if_false(skip);
        f.global("A")
            .get("prototype")
            .dup()
            .get("x")
            .number(1.0)
            .add()
            .set("x");
        f.bind(skip).ret_undefined();
    });
    b.function("ChangePrototypeValue", 2, |f| {
        f.global("ChangePrototypeValue2").local(1).call(1).pop();
        f.local(0).get("x").ret();
    });
    b.function("Test2", 1, |f| {
        let object = f.declare_local();
        let seen = f.declare_local();
        f.global("A").construct(0).set_local(object);
        f.global("ChangePrototypeValue")
            .local(object)
            .local(0)
            .call(2)
            .set_local(seen);
        f.local(object).number(1.0).set("x");
        f.global("print")
            .local(seen)
            .local(object)
            .get("x")
            .number(1.0)
            .strict_eq()
            .call(2)
            .pop();
        f.local(seen).ret();
    });
    b.function("main", 0, |f| {
        let i = f.declare_local();
        repeat(f, i, 0.0, 5.0, |f| {
            f.global("Test2").local(i).number(4.0).strict_eq().call(1).pop();
        });
        f.global("A").get("prototype").get("x").ret();
    });
}

/// `Math.sign` inlined as a native call, then replaced and restored
pub(super) fn native_replacement(b: &mut ProgramBuilder) {
    b.function("Init", 0, |f| {
        f.global("Math").get("sign").set_global("OriginalSign").ret_undefined();
    });
    b.function("Replacement", 1, |f| {
        f.number(10.0).ret();
    });
    b.function("Sign", 1, |f| {
        f.global("Math").local(0).call_method("sign", 1).ret();
    });
    b.function("SignLoop", 0, |f| {
        let i = f.declare_local();
        let sum = f.declare_local();
        f.number(0.0).set_local(sum);
        repeat(f, i, -5.0, 5.0, |f| {
            f.local(sum).global("Sign").local(i).call(1).add().set_local(sum);
        });
        f.local(sum).ret();
    });
    b.function("main", 0, |f| {
        print(f, |f| {
            f.global("SignLoop").call(0);
        });
        f.global("Math").global("Replacement").set("sign");
        print(f, |f| {
            f.global("SignLoop").call(0);
        });
        f.global("Math").global("OriginalSign").set("sign");
        f.global("SignLoop").call(0).ret();
    });
}

/// Property reads that see string, number and object receivers
pub(super) fn polymorphic_access(b: &mut ProgramBuilder) {
    b.function("Init", 0, |f| {
        f.global("String").get("prototype").number(1.0).set("d");
        f.global("Number").get("prototype").number(2.0).set("e");
        f.ret_undefined();
    });
    b.function("ReadD", 1, |f| {
        f.local(0).get("d").ret();
    });
    b.function("ReadE", 1, |f| {
        f.local(0).get("e").ret();
    });
    b.function("PolymorphicTest", 0, |f| {
        let i = f.declare_local();
        let sum = f.declare_local();
        let object = f.declare_local();
        f.new_object()
            .dup()
            .number(3.0)
            .set("d")
            .dup()
            .number(4.0)
            .set("e")
            .set_local(object);
        f.number(0.0).set_local(sum);
        repeat(f, i, 0.0, 10.0, |f| {
            f.local(sum)
                .global("ReadD")
                .string("text")
                .call(1)
                .add()
                .global("ReadD")
                .local(object)
                .call(1)
                .add()
                .global("ReadE")
                .number(7.0)
                .call(1)
                .add()
                .global("ReadE")
                .local(object)
                .call(1)
                .add()
                .set_local(sum);
        });
        f.local(sum).ret();
    });
    b.function("main", 0, |f| {
        print(f, |f| {
            f.global("PolymorphicTest").call(0);
        });
        f.global("PolymorphicTest").call(0).ret();
    });
}

/// Self recursion compiles but is never inlined
pub(super) fn recursion(b: &mut ProgramBuilder) {
    b.function("Fib", 1, |f| {
        let recurse = f.new_label();
        f.local(0).number(2.0).lt().jump_if_false(recurse);
        f.local(0).ret();
        f.bind(recurse);
        f.global("Fib")
            .local(0)
            .number(1.0)
            .sub()
            .call(1)
            .global("Fib")
            .local(0)
            .number(2.0)
            .sub()
            .call(1)
            .add()
            .ret();
    });
    b.function("main", 0, |f| {
        print(f, |f| {
            f.global("Fib").number(15.0).call(1);
        });
        f.global("Fib").number(20.0).call(1).ret();
    });
}

/// Unbounded recursion caught as a RangeError
pub(super) fn stack_overflow(b: &mut ProgramBuilder) {
    b.function("Down", 1, |f| {
        f.global("Down").local(0).number(1.0).add().call(1).ret();
    });
    b.function("main", 0, |f| {
        let caught = f.new_label();
        f.enter_try(caught);
        f.global("Down").number(0.0).call(1).pop();
        f.leave_try();
        f.string("no overflow").ret();
        f.bind(caught);
        f.dup().global("print").swap().call(1).pop();
        f.get("message").ret();
    });
}

/// Writes to frozen and sealed objects from sloppy and strict code
pub(super) fn integrity(b: &mut ProgramBuilder) {
    b.function("SetSloppy", 1, |f| {
        f.local(0).number(5.0).set("x");
        f.local(0).get("x").ret();
    });
    b.function("SetStrict", 1, |f| {
        let caught = f.new_label();
        f.strict();
        f.enter_try(caught);
        f.local(0).number(5.0).set("x");
        f.leave_try();
        f.string("assigned").ret();
        f.bind(caught);
        f.global("print").swap().call(1).pop();
        f.string("threw").ret();
    });
    b.function("IntegrityTest", 0, |f| {
        let frozen = f.declare_local();
        let sealed = f.declare_local();
        f.new_object().dup().number(1.0).set("x").set_local(frozen);
        f.global("Object").local(frozen).call_method("freeze", 1).pop();
        print(f, |f| {
            f.global("SetSloppy").local(frozen).call(1);
        });
        print(f, |f| {
            f.global("SetStrict").local(frozen).call(1);
        });
        print(f, |f| {
            f.global("Object").local(frozen).call_method("isFrozen", 1);
        });

        f.new_object().dup().number(1.0).set("y").set_local(sealed);
        f.global("Object").local(sealed).call_method("seal", 1).pop();
        f.local(sealed).number(2.0).set("y");
        f.local(sealed).number(3.0).set("z");
        f.global("print")
            .local(sealed)
            .get("y")
            .local(sealed)
            .get("z")
            .global("Object")
            .local(sealed)
            .call_method("isSealed", 1)
            .global("Object")
            .local(sealed)
            .call_method("isFrozen", 1)
            .call(4)
            .pop();
        f.local(frozen).get("x").ret();
    });
    b.function("main", 0, |f| {
        f.global("IntegrityTest").call(0).ret();
    });
}

/// A thrown error caught by a handler in an inlined callee
pub(super) fn exceptions(b: &mut ProgramBuilder) {
    b.function("Thrower", 1, |f| {
        let ok = f.new_label();
        f.local(0).number(5.0).gt().jump_if_false(ok);
        f.global("RangeError").string("too big").construct(1).throw();
        f.bind(ok);
        f.local(0).ret();
    });
    b.function("Guarded", 1, |f| {
        let caught = f.new_label();
        f.enter_try(caught);
        f.global("Thrower").local(0).call(1);
        f.leave_try();
        f.ret();
        f.bind(caught);
        f.pop().number(-1.0).ret();
    });
    b.function("ExceptionTest", 0, |f| {
        let i = f.declare_local();
        let sum = f.declare_local();
        f.number(0.0).set_local(sum);
        repeat(f, i, 0.0, 10.0, |f| {
            f.local(sum).global("Guarded").local(i).call(1).add().set_local(sum);
        });
        f.local(sum).ret();
    });
    b.function("main", 0, |f| {
        print(f, |f| {
            f.global("ExceptionTest").call(0);
        });
        print(f, |f| {
            f.global("Guarded").number(9.0).call(1);
        });
        f.global("ExceptionTest").call(0).ret();
    });
}

/// A WeakRef cleared and a finalizer scheduled by an explicit collection
pub(super) fn weak_refs(b: &mut ProgramBuilder) {
    b.function("Cleanup", 1, |f| {
        f.global("print").string("finalized").local(0).call(2).pop();
        f.ret_undefined();
    });
    b.function("WeakRefTest", 0, |f| {
        let target = f.declare_local();
        let weak = f.declare_local();
        let registry = f.declare_local();
        f.new_object().set_local(target);
        f.global("WeakRef").local(target).construct(1).set_local(weak);
        f.global("FinalizationRegistry")
            .global("Cleanup")
            .construct(1)
            .set_local(registry);
        f.local(registry)
            .local(target)
            .string("held")
            .call_method("register", 2)
            .pop();
        print(f, |f| {
            f.local(weak).call_method("deref", 0).local(target).strict_eq();
        });
        f.undefined().set_local(target);
        f.global("ArkTools").call_method("forceFullGC", 0).pop();
        print(f, |f| {
            f.local(weak).call_method("deref", 0);
        });
        f.ret_undefined();
    });
    b.function("main", 0, |f| {
        f.global("WeakRefTest").call(0).ret();
    });
}
