//! Built-in functions and objects
//!
//! This module provides the globals programs rely on: `print`, `Math`, the
//! `Object` reflection functions, error constructors, the primitive
//! prototypes, weak collections and the `ArkTools` tiering hooks.

use rustc_hash::FxHashMap;

use super::heap::{FinalizationCell, ObjectKind};
use super::vm::{NativeFn, PropertyDescriptor, Vm};
use super::{number_to_string, ObjectId, Value};
use crate::error::{Error, ErrorKind, Result};
use crate::jit::tier::Tier;

/// Register all built-in globals
pub(crate) fn install(vm: &mut Vm) {
    register_console(vm);
    register_math(vm);
    register_object(vm);
    register_error(vm);
    register_string(vm);
    register_number(vm);
    register_boolean(vm);
    register_weakref(vm);
    register_finalization_registry(vm);
    register_weakmap(vm);
    register_ark_tools(vm);
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Undefined)
}

fn number_arg(args: &[Value], index: usize) -> f64 {
    args.get(index).map_or(f64::NAN, Value::to_number)
}

/// Define a native as a hidden method of `target`
fn method(vm: &mut Vm, target: ObjectId, name: &str, func: NativeFn) {
    let function = vm.register_native(name, func, false);
    vm.define_hidden(target, name, Value::Object(function));
}

/// Register a global constructor linked both ways with its prototype object
fn constructor(vm: &mut Vm, name: &str, func: NativeFn, prototype: ObjectId, callable_with_new: bool) {
    let function = vm.register_native(name, func, callable_with_new);
    vm.define_hidden(function, "prototype", Value::Object(prototype));
    vm.define_hidden(prototype, "constructor", Value::Object(function));
    vm.set_global(name, Value::Object(function));
}

fn register_console(vm: &mut Vm) {
    let print = vm.register_native(
        "print",
        |vm, _, args| {
            let line = args.iter().map(|v| vm.display(v)).collect::<Vec<_>>().join(" ");
            vm.print_line(line);
            Ok(Value::Undefined)
        },
        false,
    );
    vm.set_global("print", Value::Object(print));
}

fn register_math(vm: &mut Vm) {
    let math = vm.new_object();
    vm.define_hidden(math, "PI", Value::Number(std::f64::consts::PI));
    vm.define_hidden(math, "E", Value::Number(std::f64::consts::E));

    // Math.abs
    method(vm, math, "abs", |_, _, args| Ok(Value::Number(number_arg(args, 0).abs())));
    // Math.floor
    method(vm, math, "floor", |_, _, args| Ok(Value::Number(number_arg(args, 0).floor())));
    // Math.ceil
    method(vm, math, "ceil", |_, _, args| Ok(Value::Number(number_arg(args, 0).ceil())));
    // Math.round: halves round toward +Infinity
    method(vm, math, "round", |_, _, args| {
        let n = number_arg(args, 0);
        if !n.is_finite() || n == 0.0 {
            return Ok(Value::Number(n));
        }
        let rounded = (n + 0.5).floor();
        Ok(Value::Number(if rounded == 0.0 && n < 0.0 { -0.0 } else { rounded }))
    });
    // Math.trunc
    method(vm, math, "trunc", |_, _, args| Ok(Value::Number(number_arg(args, 0).trunc())));
    // Math.sqrt
    method(vm, math, "sqrt", |_, _, args| Ok(Value::Number(number_arg(args, 0).sqrt())));
    // Math.sign
    method(vm, math, "sign", |_, _, args| {
        let n = number_arg(args, 0);
        let sign = if n.is_nan() || n == 0.0 {
            n
        } else if n > 0.0 {
            1.0
        } else {
            -1.0
        };
        Ok(Value::Number(sign))
    });
    // Math.pow
    method(vm, math, "pow", |_, _, args| {
        let base = number_arg(args, 0);
        let exponent = number_arg(args, 1);
        if exponent.is_nan() || (base.abs() == 1.0 && exponent.is_infinite()) {
            return Ok(Value::Number(f64::NAN));
        }
        Ok(Value::Number(base.powf(exponent)))
    });
    // Math.max
    method(vm, math, "max", |_, _, args| {
        let mut result = f64::NEG_INFINITY;
        for n in args.iter().map(Value::to_number) {
            if n.is_nan() {
                return Ok(Value::Number(f64::NAN));
            }
            if n > result || (n == 0.0 && result == 0.0 && result.is_sign_negative()) {
                result = n;
            }
        }
        Ok(Value::Number(result))
    });
    // Math.min
    method(vm, math, "min", |_, _, args| {
        let mut result = f64::INFINITY;
        for n in args.iter().map(Value::to_number) {
            if n.is_nan() {
                return Ok(Value::Number(f64::NAN));
            }
            if n < result || (n == 0.0 && result == 0.0 && n.is_sign_negative()) {
                result = n;
            }
        }
        Ok(Value::Number(result))
    });

    vm.set_global("Math", Value::Object(math));
}

fn object_arg(vm: &Vm, args: &[Value], index: usize, caller: &str) -> Result<ObjectId> {
    let value = arg(args, index);
    value
        .as_object()
        .ok_or_else(|| Error::type_error(format!("{} called on non-object {}", caller, vm.describe(&value))))
}

/// `null` or an object, as accepted for a prototype
fn proto_arg(vm: &Vm, value: &Value) -> Result<Option<ObjectId>> {
    match value {
        Value::Object(id) => Ok(Some(*id)),
        Value::Null => Ok(None),
        other => Err(Error::type_error(format!(
            "Object prototype may only be an Object or null: {}",
            vm.describe(other)
        ))),
    }
}

/// Read a descriptor object into its fields, like ToPropertyDescriptor
fn to_descriptor(vm: &mut Vm, value: &Value) -> Result<PropertyDescriptor> {
    let Some(id) = value.as_object() else {
        return Err(Error::type_error(format!(
            "Property description must be an object: {}",
            vm.describe(value)
        )));
    };
    let field = |vm: &mut Vm, name: &str| -> Result<Option<Value>> {
        let atom = vm.intern(name);
        if vm.has_property(id, atom) {
            vm.get(value, atom).map(Some)
        } else {
            Ok(None)
        }
    };
    let enumerable = field(vm, "enumerable")?.map(|v| v.to_boolean());
    let configurable = field(vm, "configurable")?.map(|v| v.to_boolean());
    let value_field = field(vm, "value")?;
    let writable = field(vm, "writable")?.map(|v| v.to_boolean());
    let getter = field(vm, "get")?;
    let setter = field(vm, "set")?;

    let accessor = |vm: &Vm, function: Option<Value>, kind: &str| -> Result<Option<ObjectId>> {
        match function {
            None | Some(Value::Undefined) => Ok(None),
            Some(f) if vm.is_callable(&f) => Ok(f.as_object()),
            Some(f) => Err(Error::type_error(format!(
                "{} must be a function: {}",
                kind,
                vm.describe(&f)
            ))),
        }
    };
    let has_accessor = getter.is_some() || setter.is_some();
    let desc = PropertyDescriptor {
        getter: accessor(vm, getter, "Getter")?,
        setter: accessor(vm, setter, "Setter")?,
        value: value_field,
        writable,
        enumerable,
        configurable,
    };
    if has_accessor && desc.is_data() {
        return Err(Error::type_error(
            "Invalid property descriptor. Cannot both specify accessors and a value or writable attribute",
        ));
    }
    Ok(desc)
}

fn register_object(vm: &mut Vm) {
    let object_proto = vm.realm().object_proto;
    let object = vm.register_native(
        "Object",
        |vm, _, args| match arg(args, 0) {
            value @ Value::Object(_) => Ok(value),
            _ => Ok(Value::Object(vm.new_object())),
        },
        true,
    );
    vm.define_hidden(object, "prototype", Value::Object(object_proto));
    vm.define_hidden(object_proto, "constructor", Value::Object(object));
    vm.set_global("Object", Value::Object(object));

    // Object.freeze
    method(vm, object, "freeze", |vm, _, args| {
        let target = arg(args, 0);
        if let Some(id) = target.as_object() {
            vm.freeze(id);
        }
        Ok(target)
    });
    // Object.seal
    method(vm, object, "seal", |vm, _, args| {
        let target = arg(args, 0);
        if let Some(id) = target.as_object() {
            vm.seal(id);
        }
        Ok(target)
    });
    // Object.preventExtensions
    method(vm, object, "preventExtensions", |vm, _, args| {
        let target = arg(args, 0);
        if let Some(id) = target.as_object() {
            vm.prevent_extensions(id);
        }
        Ok(target)
    });
    // Object.isFrozen
    method(vm, object, "isFrozen", |vm, _, args| {
        let frozen = arg(args, 0).as_object().map_or(true, |id| vm.test_integrity(id, true));
        Ok(Value::Boolean(frozen))
    });
    // Object.isSealed
    method(vm, object, "isSealed", |vm, _, args| {
        let sealed = arg(args, 0).as_object().map_or(true, |id| vm.test_integrity(id, false));
        Ok(Value::Boolean(sealed))
    });
    // Object.isExtensible
    method(vm, object, "isExtensible", |vm, _, args| {
        let extensible = arg(args, 0)
            .as_object()
            .is_some_and(|id| vm.heap()[id].shape().is_extensible());
        Ok(Value::Boolean(extensible))
    });
    // Object.defineProperty
    method(vm, object, "defineProperty", |vm, _, args| {
        let id = object_arg(vm, args, 0, "Object.defineProperty")?;
        let key = vm.display(&arg(args, 1));
        let name = vm.intern(&key);
        let desc = to_descriptor(vm, &arg(args, 2))?;
        vm.define_property(id, name, desc)?;
        Ok(Value::Object(id))
    });
    // Object.getPrototypeOf
    method(vm, object, "getPrototypeOf", |vm, _, args| {
        let target = arg(args, 0);
        if target.is_nullish() {
            return Err(Error::type_error("Cannot convert undefined or null to object"));
        }
        Ok(vm.prototype_of(&target).map_or(Value::Null, Value::Object))
    });
    // Object.setPrototypeOf
    method(vm, object, "setPrototypeOf", |vm, _, args| {
        let target = arg(args, 0);
        let proto = proto_arg(vm, &arg(args, 1))?;
        match &target {
            Value::Object(id) => vm.set_prototype(*id, proto)?,
            Value::Undefined | Value::Null => {
                return Err(Error::type_error("Object.setPrototypeOf called on null or undefined"));
            }
            _ => {}
        }
        Ok(target)
    });
    // Object.create
    method(vm, object, "create", |vm, _, args| {
        let proto = proto_arg(vm, &arg(args, 0))?;
        Ok(Value::Object(vm.alloc(proto, ObjectKind::Ordinary)))
    });

    // Object.prototype.hasOwnProperty
    method(vm, object_proto, "hasOwnProperty", |vm, this, args| {
        let key = vm.display(&arg(args, 0));
        let name = vm.intern(&key);
        Ok(Value::Boolean(
            this.as_object().is_some_and(|id| vm.has_own_property(id, name)),
        ))
    });
    // Object.prototype.toString
    method(vm, object_proto, "toString", |vm, this, _| {
        Ok(Value::string(match this {
            Value::Undefined => "[object Undefined]".to_string(),
            Value::Null => "[object Null]".to_string(),
            other => vm.display(other),
        }))
    });
}

/// Build an error object the way `new XError(message)` does
fn error_object(vm: &mut Vm, kind: ErrorKind, args: &[Value]) -> Result<Value> {
    let message = match args.first() {
        None | Some(Value::Undefined) => String::new(),
        Some(value) => vm.display(value),
    };
    let trace = vm.capture_stack_trace();
    Ok(Value::Object(vm.make_error(kind, &message, &trace)))
}

fn register_error(vm: &mut Vm) {
    let realm = *vm.realm();
    let kinds: [(ErrorKind, ObjectId, NativeFn); 4] = [
        (ErrorKind::GenericError, realm.error_proto, |vm, _, args| {
            error_object(vm, ErrorKind::GenericError, args)
        }),
        (ErrorKind::TypeError, realm.type_error_proto, |vm, _, args| {
            error_object(vm, ErrorKind::TypeError, args)
        }),
        (ErrorKind::RangeError, realm.range_error_proto, |vm, _, args| {
            error_object(vm, ErrorKind::RangeError, args)
        }),
        (ErrorKind::ReferenceError, realm.reference_error_proto, |vm, _, args| {
            error_object(vm, ErrorKind::ReferenceError, args)
        }),
    ];
    for (kind, proto, func) in kinds {
        constructor(vm, kind.name(), func, proto, true);
        vm.define_hidden(proto, "name", Value::string(kind.name()));
        vm.define_hidden(proto, "message", Value::string(""));
    }

    // Error.prototype.toString
    method(vm, realm.error_proto, "toString", |vm, this, _| match this.as_object() {
        Some(id) => Ok(Value::string(vm.error_summary(id))),
        None => Err(Error::type_error("Error.prototype.toString called on non-object")),
    });
}

/// UTF-16 code units of a string receiver
fn this_string(this: &Value, caller: &str) -> Result<Vec<u16>> {
    match this {
        Value::String(s) => Ok(s.encode_utf16().collect()),
        other => Err(Error::type_error(format!(
            "{} requires that 'this' be a String, not {}",
            caller,
            other.type_of()
        ))),
    }
}

/// Relative index argument clamped into `0..=len`
fn relative_index(value: &Value, len: usize, default: usize) -> usize {
    if value.is_undefined() {
        return default;
    }
    let n = value.to_number();
    let n = if n.is_nan() { 0.0 } else { n.trunc() };
    let len_f = len as f64;
    let index = if n < 0.0 { (len_f + n).max(0.0) } else { n.min(len_f) };
    index as usize
}

fn register_string(vm: &mut Vm) {
    let proto = vm.realm().string_proto;
    constructor(
        vm,
        "String",
        |vm, _, args| {
            Ok(match args.first() {
                None => Value::string(""),
                Some(value) => Value::string(vm.display(value)),
            })
        },
        proto,
        false,
    );

    // String.prototype.charAt
    method(vm, proto, "charAt", |_, this, args| {
        let units = this_string(this, "String.prototype.charAt")?;
        let index = args.first().map_or(0.0, Value::to_number);
        let index = if index.is_nan() { 0.0 } else { index.trunc() };
        if index < 0.0 || index >= units.len() as f64 {
            return Ok(Value::string(""));
        }
        Ok(Value::string(String::from_utf16_lossy(&units[index as usize..index as usize + 1])))
    });
    // String.prototype.indexOf
    method(vm, proto, "indexOf", |vm, this, args| {
        let units = this_string(this, "String.prototype.indexOf")?;
        let needle: Vec<u16> = vm.display(&arg(args, 0)).encode_utf16().collect();
        let from = relative_index(&arg(args, 1), units.len(), 0).min(units.len());
        if needle.is_empty() {
            return Ok(Value::Number(from as f64));
        }
        let found = units[from..]
            .windows(needle.len())
            .position(|w| w == needle.as_slice())
            .map_or(-1.0, |i| (i + from) as f64);
        Ok(Value::Number(found))
    });
    // String.prototype.slice
    method(vm, proto, "slice", |_, this, args| {
        let units = this_string(this, "String.prototype.slice")?;
        let len = units.len();
        let start = relative_index(&arg(args, 0), len, 0);
        let end = relative_index(&arg(args, 1), len, len);
        if start >= end {
            return Ok(Value::string(""));
        }
        Ok(Value::string(String::from_utf16_lossy(&units[start..end])))
    });
    // String.prototype.toUpperCase
    method(vm, proto, "toUpperCase", |_, this, _| match this {
        Value::String(s) => Ok(Value::string(s.to_uppercase())),
        _ => Err(Error::type_error("String.prototype.toUpperCase called on non-string")),
    });
    // String.prototype.toLowerCase
    method(vm, proto, "toLowerCase", |_, this, _| match this {
        Value::String(s) => Ok(Value::string(s.to_lowercase())),
        _ => Err(Error::type_error("String.prototype.toLowerCase called on non-string")),
    });
    // String.prototype.toString
    method(vm, proto, "toString", |_, this, _| match this {
        Value::String(_) => Ok(this.clone()),
        _ => Err(Error::type_error("String.prototype.toString requires that 'this' be a String")),
    });
}

fn register_number(vm: &mut Vm) {
    let proto = vm.realm().number_proto;
    constructor(
        vm,
        "Number",
        |_, _, args| Ok(Value::Number(args.first().map_or(0.0, Value::to_number))),
        proto,
        false,
    );

    // Number.prototype.toFixed
    method(vm, proto, "toFixed", |_, this, args| {
        let Value::Number(n) = this else {
            return Err(Error::type_error("Number.prototype.toFixed requires that 'this' be a Number"));
        };
        let digits = args.first().map_or(0.0, Value::to_number);
        let digits = if digits.is_nan() { 0.0 } else { digits.trunc() };
        if !(0.0..=100.0).contains(&digits) {
            return Err(Error::range_error("toFixed() digits argument must be between 0 and 100"));
        }
        if !n.is_finite() || n.abs() >= 1e21 {
            return Ok(Value::string(number_to_string(*n)));
        }
        Ok(Value::string(format!("{:.*}", digits as usize, n)))
    });
    // Number.prototype.toString
    method(vm, proto, "toString", |_, this, _| match this {
        Value::Number(n) => Ok(Value::string(number_to_string(*n))),
        _ => Err(Error::type_error("Number.prototype.toString requires that 'this' be a Number")),
    });
}

fn register_boolean(vm: &mut Vm) {
    let proto = vm.realm().boolean_proto;
    constructor(
        vm,
        "Boolean",
        |_, _, args| Ok(Value::Boolean(args.first().is_some_and(Value::to_boolean))),
        proto,
        false,
    );

    // Boolean.prototype.toString
    method(vm, proto, "toString", |_, this, _| match this {
        Value::Boolean(b) => Ok(Value::string(if *b { "true" } else { "false" })),
        _ => Err(Error::type_error("Boolean.prototype.toString requires that 'this' be a Boolean")),
    });
}

fn register_weakref(vm: &mut Vm) {
    let proto = vm.realm().weak_ref_proto;
    constructor(
        vm,
        "WeakRef",
        |vm, _, args| {
            let Some(target) = arg(args, 0).as_object() else {
                return Err(Error::type_error("WeakRef: target must be an object"));
            };
            let proto = vm.realm().weak_ref_proto;
            Ok(Value::Object(vm.alloc(Some(proto), ObjectKind::WeakRef { target: Some(target) })))
        },
        proto,
        true,
    );

    // WeakRef.prototype.deref
    method(vm, proto, "deref", |vm, this, _| {
        let object = this.as_object().and_then(|id| vm.heap().get(id));
        match object.map(|o| o.kind()) {
            Some(ObjectKind::WeakRef { target }) => Ok(target
                .filter(|t| vm.heap().is_live(*t))
                .map_or(Value::Undefined, Value::Object)),
            _ => Err(Error::type_error("WeakRef.prototype.deref called on incompatible receiver")),
        }
    });
}

fn register_finalization_registry(vm: &mut Vm) {
    let proto = vm.realm().finalization_registry_proto;
    constructor(
        vm,
        "FinalizationRegistry",
        |vm, _, args| {
            let callback = arg(args, 0);
            let Some(callback) = callback.as_object().filter(|_| vm.is_callable(&callback)) else {
                return Err(Error::type_error("FinalizationRegistry: cleanup must be callable"));
            };
            let proto = vm.realm().finalization_registry_proto;
            let kind = ObjectKind::FinalizationRegistry {
                callback,
                cells: Vec::new(),
            };
            Ok(Value::Object(vm.alloc(Some(proto), kind)))
        },
        proto,
        true,
    );

    // FinalizationRegistry.prototype.register
    method(vm, proto, "register", |vm, this, args| {
        let Some(target) = arg(args, 0).as_object() else {
            return Err(Error::type_error("FinalizationRegistry.prototype.register: target must be an object"));
        };
        let held = arg(args, 1);
        if held.as_object() == Some(target) {
            return Err(Error::type_error(
                "FinalizationRegistry.prototype.register: target and holdings must not be same",
            ));
        }
        let registry = this.as_object().and_then(|id| vm.heap_mut().get_mut(id));
        match registry.map(|o| &mut o.kind) {
            Some(ObjectKind::FinalizationRegistry { cells, .. }) => {
                cells.push(FinalizationCell { target, held });
                Ok(Value::Undefined)
            }
            _ => Err(Error::type_error(
                "FinalizationRegistry.prototype.register called on incompatible receiver",
            )),
        }
    });
}

/// Entries of a WeakMap receiver
fn weak_map_entries<'a>(vm: &'a mut Vm, this: &Value, caller: &str) -> Result<&'a mut FxHashMap<ObjectId, Value>> {
    let object = this.as_object().and_then(|id| vm.heap_mut().get_mut(id));
    match object.map(|o| &mut o.kind) {
        Some(ObjectKind::WeakMap { entries }) => Ok(entries),
        _ => Err(Error::type_error(format!(
            "Method WeakMap.prototype.{} called on incompatible receiver",
            caller
        ))),
    }
}

fn register_weakmap(vm: &mut Vm) {
    let proto = vm.realm().weak_map_proto;
    constructor(
        vm,
        "WeakMap",
        |vm, _, _| {
            let proto = vm.realm().weak_map_proto;
            let kind = ObjectKind::WeakMap {
                entries: FxHashMap::default(),
            };
            Ok(Value::Object(vm.alloc(Some(proto), kind)))
        },
        proto,
        true,
    );

    // WeakMap.prototype.get
    method(vm, proto, "get", |vm, this, args| {
        let key = arg(args, 0).as_object();
        let entries = weak_map_entries(vm, this, "get")?;
        Ok(key
            .and_then(|k| entries.get(&k).cloned())
            .unwrap_or(Value::Undefined))
    });
    // WeakMap.prototype.set
    method(vm, proto, "set", |vm, this, args| {
        let Some(key) = arg(args, 0).as_object() else {
            return Err(Error::type_error("Invalid value used as weak map key"));
        };
        weak_map_entries(vm, this, "set")?.insert(key, arg(args, 1));
        Ok(this.clone())
    });
    // WeakMap.prototype.has
    method(vm, proto, "has", |vm, this, args| {
        let key = arg(args, 0).as_object();
        let entries = weak_map_entries(vm, this, "has")?;
        Ok(Value::Boolean(key.is_some_and(|k| entries.contains_key(&k))))
    });
    // WeakMap.prototype.delete
    method(vm, proto, "delete", |vm, this, args| {
        let key = arg(args, 0).as_object();
        let entries = weak_map_entries(vm, this, "delete")?;
        Ok(Value::Boolean(key.is_some_and(|k| entries.remove(&k).is_some())))
    });
}

/// Script function behind an `ArkTools` argument
fn script_function(vm: &Vm, args: &[Value], caller: &str) -> Result<crate::bytecode::FunctionId> {
    let value = arg(args, 0);
    vm.function_of(&value).ok_or_else(|| {
        Error::type_error(format!(
            "ArkTools.{}: {} is not a script function",
            caller,
            vm.describe(&value)
        ))
    })
}

/// Tiering and GC hooks used by tests written in script
fn register_ark_tools(vm: &mut Vm) {
    let tools = vm.new_object();

    // ArkTools.jitCompileAsync
    method(vm, tools, "jitCompileAsync", |vm, _, args| {
        let function = script_function(vm, args, "jitCompileAsync")?;
        Ok(Value::Boolean(vm.request_compile(function, Tier::Jit)))
    });
    // ArkTools.waitJitCompileFinish
    method(vm, tools, "waitJitCompileFinish", |vm, _, args| {
        let function = script_function(vm, args, "waitJitCompileFinish")?;
        Ok(Value::Boolean(vm.wait_for_compile(function)))
    });
    // ArkTools.getTier
    method(vm, tools, "getTier", |vm, _, args| {
        let function = script_function(vm, args, "getTier")?;
        Ok(Value::string(vm.tiers().state(function).to_string()))
    });
    // ArkTools.getDeoptCount
    method(vm, tools, "getDeoptCount", |vm, _, args| {
        let function = script_function(vm, args, "getDeoptCount")?;
        Ok(Value::Number(vm.tiers().deopt_count(function) as f64))
    });
    // ArkTools.getICPopulation
    method(vm, tools, "getICPopulation", |vm, _, args| {
        let function = script_function(vm, args, "getICPopulation")?;
        Ok(Value::Number(vm.feedback().ic_population(function) as f64))
    });
    // ArkTools.forceFullGC
    method(vm, tools, "forceFullGC", |vm, _, _| {
        vm.collect_garbage();
        Ok(Value::Undefined)
    });

    vm.set_global("ArkTools", Value::Object(tools));
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bytecode::ProgramBuilder;
    use crate::config::EngineConfig;

    fn run(build: impl FnOnce(&mut ProgramBuilder)) -> (Vm, Result<Value>) {
        let mut builder = ProgramBuilder::new();
        build(&mut builder);
        let program = Arc::new(builder.build().unwrap());
        let mut vm = Vm::new(program, EngineConfig::default().with_synchronous_compilation()).unwrap();
        let main = vm.global("main").unwrap();
        let result = vm.call_top_level(&main, vec![]);
        (vm, result)
    }

    #[test]
    fn test_math_sign() {
        let (_, result) = run(|b| {
            b.function("main", 0, |f| {
                f.global("Math").number(-7.5).call_method("sign", 1).ret();
            });
        });
        assert_eq!(result.unwrap(), Value::Number(-1.0));
    }

    #[test]
    fn test_print_joins_arguments() {
        let (vm, result) = run(|b| {
            b.function("main", 0, |f| {
                f.global("print").string("a").number(1.0).call(2).pop().undefined().ret();
            });
        });
        result.unwrap();
        assert_eq!(vm.output(), ["a 1"]);
    }

    #[test]
    fn test_freeze_reports_frozen() {
        let (_, result) = run(|b| {
            b.function("main", 0, |f| {
                let object = f.declare_local();
                f.global("Object").new_object().call_method("freeze", 1).set_local(object);
                f.global("Object").local(object).call_method("isFrozen", 1).ret();
            });
        });
        assert_eq!(result.unwrap(), Value::Boolean(true));
    }

    #[test]
    fn test_error_constructor_message() {
        let (vm, result) = run(|b| {
            b.function("main", 0, |f| {
                f.global("TypeError").string("bad").construct(1).ret();
            });
        });
        let error = result.unwrap();
        assert_eq!(vm.display(&error), "TypeError: bad");
    }

    #[test]
    fn test_string_methods() {
        let (_, result) = run(|b| {
            b.function("main", 0, |f| {
                f.string("hello").number(1.0).number(3.0).call_method("slice", 2).ret();
            });
        });
        assert_eq!(result.unwrap(), Value::string("el"));
    }

    #[test]
    fn test_weak_map_requires_object_key() {
        let (_, result) = run(|b| {
            b.function("main", 0, |f| {
                f.global("WeakMap").construct(0).number(1.0).number(2.0).call_method("set", 2).ret();
            });
        });
        assert!(result.unwrap_err().to_string().contains("Invalid value used as weak map key"));
    }
}
