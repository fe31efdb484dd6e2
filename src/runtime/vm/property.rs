//! Property access through inline caches
//!
//! Every access site keys its cache on the receiver's shape (objects) or
//! primitive class. A hit completes the access from the cached handler; a
//! miss walks the prototype chain, performs the access and caches what it
//! found. Handlers that depend on prototypes carry the version of every
//! prototype visited, so a changed prototype turns the hit into a miss.

use std::sync::Arc;

use super::{Callee, Vm};
use crate::error::{messages, Error, Result};
use crate::jit::feedback::{FeedbackKey, SiteId};
use crate::jit::ic::{CallTarget, Handler, IcKey, ProtoLink};
use crate::runtime::heap::{ObjectKind, Slot};
use crate::runtime::intern::Atom;
use crate::runtime::shape::{PropertyFlags, Shape};
use crate::runtime::{ObjectId, Value};

/// Attributes for `Object.defineProperty`; absent fields keep their current
/// value, or default to false for a new property
#[derive(Debug, Clone, Default)]
pub struct PropertyDescriptor {
    pub value: Option<Value>,
    pub getter: Option<ObjectId>,
    pub setter: Option<ObjectId>,
    pub writable: Option<bool>,
    pub enumerable: Option<bool>,
    pub configurable: Option<bool>,
}

impl PropertyDescriptor {
    pub fn data(value: Value) -> Self {
        Self {
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn is_accessor(&self) -> bool {
        self.getter.is_some() || self.setter.is_some()
    }

    pub fn is_data(&self) -> bool {
        self.value.is_some() || self.writable.is_some()
    }
}

/// What a resolved load yields
enum Found {
    Data(Value),
    Getter(Option<ObjectId>),
}

/// What a resolved store does
enum Store {
    Write(u32),
    Add(Arc<Shape>),
    Setter(ObjectId),
    Ignore,
}

impl Vm {
    fn receiver_key(value: &Value, heap: &crate::runtime::heap::Heap) -> Option<IcKey> {
        match value {
            Value::Object(id) => Some(IcKey::Shape(heap[*id].shape().id())),
            Value::Undefined | Value::Null => None,
            other => other.primitive_tag().map(IcKey::Primitive),
        }
    }

    fn chain_is_current(&self, chain: &[ProtoLink]) -> bool {
        chain
            .iter()
            .all(|link| self.heap.version(link.object) == Some(link.version))
    }

    fn update_site(&self, site: SiteId, key: IcKey, handler: Handler) {
        let limit = self.feedback.polymorphic_limit();
        self.feedback
            .with_site(site, |s| s.cache.update(key, handler, limit));
    }

    /// Property read without an access site
    pub fn get(&mut self, receiver: &Value, name: Atom) -> Result<Value> {
        self.get_property(receiver, name, None)
    }

    /// Property write without an access site
    pub fn set(&mut self, receiver: &Value, name: Atom, value: Value, strict: bool) -> Result<()> {
        self.set_property(receiver, name, value, strict, None)
    }

    pub(crate) fn get_property(&mut self, receiver: &Value, name: Atom, site: Option<SiteId>) -> Result<Value> {
        let Some(key) = Self::receiver_key(receiver, &self.heap) else {
            return Err(Error::type_error(messages::cannot_read_property(
                self.resolve(name),
                &receiver.to_js_string(),
            )));
        };

        if let Some(site) = site {
            let handler = self.feedback.with_site(site, |s| {
                s.histogram.record(FeedbackKey::from(key));
                s.cache.lookup(key).cloned()
            });
            if let Some(handler) = handler {
                if let Some(value) = self.apply_load(receiver, &handler)? {
                    return Ok(value);
                }
            }
        }

        let (found, handler) = self.resolve_load(receiver, name);
        if let Some(site) = site {
            self.update_site(site, key, handler);
        }
        match found {
            Found::Data(value) => Ok(value),
            Found::Getter(getter) => self.call_getter(getter, receiver),
        }
    }

    /// Complete a load from a cached handler; `None` if it no longer applies
    fn apply_load(&mut self, receiver: &Value, handler: &Handler) -> Result<Option<Value>> {
        if !self.chain_is_current(handler.chain()) {
            return Ok(None);
        }
        let value = match handler {
            Handler::Field { offset } => receiver
                .as_object()
                .and_then(|id| self.heap[id].slots[*offset as usize].value().cloned()),
            Handler::ProtoField { holder, offset, .. } => {
                self.heap[*holder].slots[*offset as usize].value().cloned()
            }
            Handler::Missing { .. } => Some(Value::Undefined),
            Handler::StringLength => match receiver {
                Value::String(s) => Some(Value::Number(s.encode_utf16().count() as f64)),
                _ => None,
            },
            Handler::Accessor { holder, offset, .. } => {
                let Some(owner) = holder.or_else(|| receiver.as_object()) else {
                    return Ok(None);
                };
                let getter = match &self.heap[owner].slots[*offset as usize] {
                    Slot::Accessor { getter, .. } => *getter,
                    Slot::Data(_) => return Ok(None),
                };
                return self.call_getter(getter, receiver).map(Some);
            }
            Handler::Transition { .. } | Handler::Target(_) => None,
        };
        Ok(value)
    }

    /// Walk the receiver and its prototypes for `name`
    fn resolve_load(&self, receiver: &Value, name: Atom) -> (Found, Handler) {
        let start = match receiver {
            Value::Object(id) => {
                if let Some((offset, _, slot)) = self.heap[*id].own(name) {
                    return match slot {
                        Slot::Data(value) => (Found::Data(value.clone()), Handler::Field { offset }),
                        Slot::Accessor { getter, .. } => (
                            Found::Getter(*getter),
                            Handler::Accessor {
                                holder: None,
                                offset,
                                chain: Vec::new(),
                            },
                        ),
                    };
                }
                self.heap[*id].proto()
            }
            Value::String(s) => {
                if name == self.names.length {
                    let length = s.encode_utf16().count() as f64;
                    return (Found::Data(Value::Number(length)), Handler::StringLength);
                }
                Some(self.realm.string_proto)
            }
            Value::Number(_) => Some(self.realm.number_proto),
            Value::Boolean(_) => Some(self.realm.boolean_proto),
            Value::Undefined | Value::Null => None,
        };

        let mut chain = Vec::new();
        let mut cursor = start;
        while let Some(proto) = cursor {
            let object = &self.heap[proto];
            chain.push(ProtoLink {
                object: proto,
                version: object.version(),
            });
            if let Some((offset, _, slot)) = object.own(name) {
                return match slot {
                    Slot::Data(value) => (
                        Found::Data(value.clone()),
                        Handler::ProtoField {
                            holder: proto,
                            offset,
                            chain,
                        },
                    ),
                    Slot::Accessor { getter, .. } => (
                        Found::Getter(*getter),
                        Handler::Accessor {
                            holder: Some(proto),
                            offset,
                            chain,
                        },
                    ),
                };
            }
            cursor = object.proto();
        }
        (Found::Data(Value::Undefined), Handler::Missing { chain })
    }

    fn call_getter(&mut self, getter: Option<ObjectId>, receiver: &Value) -> Result<Value> {
        match getter {
            Some(getter) => self.call_value(&Value::Object(getter), receiver.clone(), Vec::new()),
            None => Ok(Value::Undefined),
        }
    }

    pub(crate) fn set_property(
        &mut self,
        receiver: &Value,
        name: Atom,
        value: Value,
        strict: bool,
        site: Option<SiteId>,
    ) -> Result<()> {
        let id = match receiver {
            Value::Object(id) => *id,
            Value::Undefined | Value::Null => {
                return Err(Error::type_error(messages::cannot_set_property(
                    self.resolve(name),
                    &receiver.to_js_string(),
                )));
            }
            primitive => {
                if strict {
                    return Err(Error::type_error(format!(
                        "Cannot create property '{}' on {} '{}'",
                        self.resolve(name),
                        primitive.type_of(),
                        primitive.to_js_string()
                    )));
                }
                return Ok(());
            }
        };
        let key = IcKey::Shape(self.heap[id].shape().id());

        if let Some(site) = site {
            let handler = self.feedback.with_site(site, |s| {
                s.histogram.record(FeedbackKey::from(key));
                s.cache.lookup(key).cloned()
            });
            if let Some(handler) = handler {
                if self.apply_store(id, &handler, &value)? {
                    return Ok(());
                }
            }
        }

        let (store, handler) = self.resolve_store(id, name, strict)?;
        if let (Some(site), Some(handler)) = (site, handler) {
            self.update_site(site, key, handler);
        }
        match store {
            Store::Write(offset) => self.heap.write_value(id, offset, value),
            Store::Add(shape) => self.heap.apply_transition(id, shape, Slot::Data(value)),
            Store::Setter(setter) => {
                self.call_value(&Value::Object(setter), receiver.clone(), vec![value])?;
            }
            Store::Ignore => {}
        }
        Ok(())
    }

    /// Complete a store from a cached handler; false if it no longer applies
    fn apply_store(&mut self, id: ObjectId, handler: &Handler, value: &Value) -> Result<bool> {
        if !self.chain_is_current(handler.chain()) {
            return Ok(false);
        }
        match handler {
            Handler::Field { offset } => {
                self.heap.write_value(id, *offset, value.clone());
                Ok(true)
            }
            Handler::Transition { shape, .. } => {
                self.heap
                    .apply_transition(id, Arc::clone(shape), Slot::Data(value.clone()));
                Ok(true)
            }
            Handler::Accessor { holder, offset, .. } => {
                let owner = holder.unwrap_or(id);
                let setter = match &self.heap[owner].slots[*offset as usize] {
                    Slot::Accessor {
                        setter: Some(setter), ..
                    } => *setter,
                    _ => return Ok(false),
                };
                self.call_value(&Value::Object(setter), Value::Object(id), vec![value.clone()])?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn resolve_store(&self, id: ObjectId, name: Atom, strict: bool) -> Result<(Store, Option<Handler>)> {
        let object = &self.heap[id];
        if let Some((offset, flags, slot)) = object.own(name) {
            if let Slot::Accessor { setter, .. } = slot {
                return match setter {
                    Some(setter) => Ok((
                        Store::Setter(*setter),
                        Some(Handler::Accessor {
                            holder: None,
                            offset,
                            chain: Vec::new(),
                        }),
                    )),
                    None => self.refuse(strict, || self.getter_only(name)),
                };
            }
            if !flags.is_writable() {
                return self.refuse(strict, || messages::read_only(self.resolve(name)));
            }
            return Ok((Store::Write(offset), Some(Handler::Field { offset })));
        }

        let mut chain = Vec::new();
        let mut cursor = object.proto();
        while let Some(proto) = cursor {
            let holder = &self.heap[proto];
            chain.push(ProtoLink {
                object: proto,
                version: holder.version(),
            });
            if let Some((offset, flags, slot)) = holder.own(name) {
                match slot {
                    Slot::Accessor {
                        setter: Some(setter), ..
                    } => {
                        return Ok((
                            Store::Setter(*setter),
                            Some(Handler::Accessor {
                                holder: Some(proto),
                                offset,
                                chain,
                            }),
                        ));
                    }
                    Slot::Accessor { setter: None, .. } => {
                        return self.refuse(strict, || self.getter_only(name));
                    }
                    Slot::Data(_) if !flags.is_writable() => {
                        return self.refuse(strict, || messages::read_only(self.resolve(name)));
                    }
                    Slot::Data(_) => break,
                }
            }
            cursor = holder.proto();
        }

        if !object.shape().is_extensible() {
            return self.refuse(strict, || messages::not_extensible(self.resolve(name)));
        }
        let next = self.shapes.add(object.shape(), name, PropertyFlags::DEFAULT);
        Ok((
            Store::Add(Arc::clone(&next)),
            Some(Handler::Transition { shape: next, chain }),
        ))
    }

    /// Failed assignment: a TypeError in strict code, ignored otherwise
    fn refuse(&self, strict: bool, message: impl FnOnce() -> String) -> Result<(Store, Option<Handler>)> {
        if strict {
            Err(Error::type_error(message()))
        } else {
            Ok((Store::Ignore, None))
        }
    }

    fn getter_only(&self, name: Atom) -> String {
        format!(
            "Cannot set property {} of #<Object> which has only a getter",
            self.resolve(name)
        )
    }

    /// `delete receiver[name]`
    pub(crate) fn delete_property(&mut self, receiver: &Value, name: Atom, strict: bool) -> Result<bool> {
        let id = match receiver {
            Value::Object(id) => *id,
            Value::Undefined | Value::Null => {
                return Err(Error::type_error(format!(
                    "Cannot convert {} to object",
                    receiver.to_js_string()
                )));
            }
            _ => return Ok(true),
        };
        match self.heap[id].own(name) {
            None => Ok(true),
            Some((_, flags, _)) if !flags.is_configurable() => {
                if strict {
                    Err(Error::type_error(messages::cannot_delete(self.resolve(name))))
                } else {
                    Ok(false)
                }
            }
            Some(_) => Ok(self.heap.remove_property(&self.shapes, id, name)),
        }
    }

    /// `Object.defineProperty`; always throws on an invalid redefinition
    pub fn define_property(&mut self, id: ObjectId, name: Atom, desc: PropertyDescriptor) -> Result<()> {
        let current = self
            .heap[id]
            .own(name)
            .map(|(_, flags, slot)| (flags, slot.clone()));
        let Some((flags, slot)) = current else {
            if !self.heap[id].shape().is_extensible() {
                return Err(Error::type_error(messages::not_extensible(self.resolve(name))));
            }
            let (flags, slot) = Self::fresh_property(&desc);
            self.heap.add_property(&self.shapes, id, name, flags, slot);
            return Ok(());
        };

        if !flags.is_configurable() {
            let redefine = || Err(Error::type_error(messages::cannot_redefine(self.resolve(name))));
            if desc.configurable == Some(true)
                || desc.enumerable.is_some_and(|e| e != flags.contains(PropertyFlags::ENUMERABLE))
                || (desc.is_accessor() && !flags.is_accessor())
                || (desc.is_data() && flags.is_accessor())
            {
                return redefine();
            }
            if let Slot::Data(existing) = &slot {
                if !flags.is_writable() {
                    if desc.writable == Some(true) {
                        return redefine();
                    }
                    if desc.value.as_ref().is_some_and(|v| !v.same_value(existing)) {
                        return redefine();
                    }
                }
            }
        }

        let mut merged = PropertyFlags::empty();
        merged.set(
            PropertyFlags::ENUMERABLE,
            desc.enumerable.unwrap_or(flags.contains(PropertyFlags::ENUMERABLE)),
        );
        merged.set(
            PropertyFlags::CONFIGURABLE,
            desc.configurable.unwrap_or(flags.is_configurable()),
        );
        let accessor = desc.is_accessor() || (!desc.is_data() && flags.is_accessor());
        let slot = if accessor {
            merged |= PropertyFlags::ACCESSOR;
            let (getter, setter) = match slot {
                Slot::Accessor { getter, setter } => (getter, setter),
                Slot::Data(_) => (None, None),
            };
            Slot::Accessor {
                getter: desc.getter.or(getter),
                setter: desc.setter.or(setter),
            }
        } else {
            let (value, writable) = match slot {
                Slot::Data(value) => (value, flags.is_writable()),
                Slot::Accessor { .. } => (Value::Undefined, false),
            };
            merged.set(PropertyFlags::WRITABLE, desc.writable.unwrap_or(writable));
            Slot::Data(desc.value.unwrap_or(value))
        };
        self.heap.reconfigure_property(&self.shapes, id, name, merged, slot);
        Ok(())
    }

    fn fresh_property(desc: &PropertyDescriptor) -> (PropertyFlags, Slot) {
        let mut flags = PropertyFlags::empty();
        flags.set(PropertyFlags::ENUMERABLE, desc.enumerable.unwrap_or(false));
        flags.set(PropertyFlags::CONFIGURABLE, desc.configurable.unwrap_or(false));
        if desc.is_accessor() {
            flags |= PropertyFlags::ACCESSOR;
            let slot = Slot::Accessor {
                getter: desc.getter,
                setter: desc.setter,
            };
            return (flags, slot);
        }
        flags.set(PropertyFlags::WRITABLE, desc.writable.unwrap_or(false));
        (flags, Slot::Data(desc.value.clone().unwrap_or(Value::Undefined)))
    }

    /// Data property lookup along the prototype chain, without running getters
    pub fn lookup_data(&self, id: ObjectId, name: Atom) -> Option<Value> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let object = self.heap.get(current)?;
            if let Some((_, _, slot)) = object.own(name) {
                return slot.value().cloned();
            }
            cursor = object.proto();
        }
        None
    }

    /// Record the callee observed at a call site
    pub(crate) fn record_callee(&self, site: SiteId, callee: &Value) {
        let Some(id) = callee.as_object() else {
            return;
        };
        let target = match self.callee_of(callee) {
            Some(Callee::Script(function)) => CallTarget::Script { callee: id, function },
            Some(Callee::Native(native)) => CallTarget::Native { callee: id, native },
            None => return,
        };
        let key = IcKey::Callee(id);
        let limit = self.feedback.polymorphic_limit();
        self.feedback.with_site(site, |s| {
            s.histogram.record(FeedbackKey::Callee(id));
            if s.cache.lookup(key).is_none() {
                s.cache.update(key, Handler::Target(target), limit);
            }
        });
    }

    /// Whether an object is frozen (`frozen`) or sealed
    pub fn test_integrity(&self, id: ObjectId, frozen: bool) -> bool {
        let object = &self.heap[id];
        let shape = object.shape();
        if (frozen && shape.is_frozen()) || (!frozen && shape.is_sealed()) {
            return true;
        }
        if shape.is_extensible() {
            return false;
        }
        shape.properties().iter().all(|p| {
            !p.flags.is_configurable() && !(frozen && !p.flags.is_accessor() && p.flags.is_writable())
        })
    }

    pub fn freeze(&mut self, id: ObjectId) {
        self.heap.freeze(&self.shapes, id);
    }

    pub fn seal(&mut self, id: ObjectId) {
        self.heap.seal(&self.shapes, id);
    }

    pub fn prevent_extensions(&mut self, id: ObjectId) {
        self.heap.prevent_extensions(&self.shapes, id);
    }

    /// `Object.setPrototypeOf`: refuses cycles and non-extensible targets
    pub fn set_prototype(&mut self, id: ObjectId, proto: Option<ObjectId>) -> Result<()> {
        let shape = self.heap[id].shape();
        if shape.proto() == proto {
            return Ok(());
        }
        if !shape.is_extensible() {
            return Err(Error::type_error("#<Object> is not extensible"));
        }
        let mut cursor = proto;
        while let Some(current) = cursor {
            if current == id {
                return Err(Error::type_error("Cyclic __proto__ value"));
            }
            cursor = self.heap[current].proto();
        }
        self.heap.set_proto(&self.shapes, id, proto);
        Ok(())
    }

    /// Prototype a value delegates to, primitives included
    pub fn prototype_of(&self, value: &Value) -> Option<ObjectId> {
        match value {
            Value::Object(id) => self.heap[*id].proto(),
            Value::String(_) => Some(self.realm.string_proto),
            Value::Number(_) => Some(self.realm.number_proto),
            Value::Boolean(_) => Some(self.realm.boolean_proto),
            Value::Undefined | Value::Null => None,
        }
    }

    /// `name in object`, without running getters
    pub fn has_property(&self, id: ObjectId, name: Atom) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let object = &self.heap[current];
            if object.own(name).is_some() {
                return true;
            }
            cursor = object.proto();
        }
        false
    }

    pub fn has_own_property(&self, id: ObjectId, name: Atom) -> bool {
        self.heap[id].own(name).is_some()
    }

    /// Whether a value is an object of the given kind
    pub(crate) fn is_kind(&self, value: &Value, test: impl Fn(&ObjectKind) -> bool) -> bool {
        value
            .as_object()
            .and_then(|id| self.heap.get(id))
            .is_some_and(|o| test(o.kind()))
    }
}
