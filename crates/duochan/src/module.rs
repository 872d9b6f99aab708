//! # Module
//!
//! The registry that replaces runtime reflection. Every type that can be
//! activated, invoked or passed by reference implements `Remote` and
//! describes its constructor and members on a `Class` builder. A `Module`
//! collects classes and gives the local ones compact wire tokens.
//!
//! ## Type and method references
//!
//! ```text
//! type ref    [1][token: i32]                       local class
//!             [2][name: str]                        anything else
//! method ref  [1][class token << 16 | member: i32]  member of a local class
//!             [2][type: str][kind: u8][member: str]
//! ```
//!
//! Both forms decode on either side. Tokens are only meaningful between
//! processes that registered the same local classes in the same order.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use duopack::Reader;
use duopack::Writer;

use crate::error::Fault;
use crate::handler::AsyncMethod;
use crate::handler::Invoke;
use crate::handler::Returned;
use crate::handler::SyncMethod;
use crate::value::Expect;
use crate::value::IntoValue;

/// A shared, type-erased object instance.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// A type whose instances can live behind a `RemoteProxy`.
///
/// `TYPE_NAME` is the wire identity of the type and must match on both
/// sides of a channel. Marker types used only for casts can keep the
/// default, empty, `describe`.
pub trait Remote: Any + Send + Sync + Sized {
    const TYPE_NAME: &'static str;

    fn describe(class: &mut Class<Self>) {
        let _ = class;
    }
}

/// Whether a member is invoked as a method or read as a property.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    Method = 1,
    Property = 2,
}

impl MemberKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Method),
            2 => Some(Self::Property),
            _ => None,
        }
    }
}

/// One invocable member of a class.
pub struct Member {
    pub(crate) name: &'static str,
    pub(crate) kind: MemberKind,
    pub(crate) is_async: bool,
    pub(crate) params: Vec<Expect>,
    pub(crate) invoke: Invoke,
}

impl Member {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> MemberKind {
        self.kind
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

type Constructor = Box<dyn Fn() -> Result<Instance, Fault> + Send + Sync>;

/// The type-erased description of a `Remote` type.
pub struct ClassEntry {
    name: &'static str,
    implements: Vec<&'static str>,
    constructor: Option<Constructor>,
    members: Vec<Member>,
}

impl ClassEntry {
    /// Builds the class of `T` from its `describe`.
    pub fn of<T: Remote>() -> Arc<ClassEntry> {
        let mut class = Class::<T>::new();
        T::describe(&mut class);
        Arc::new(class.entry)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn implements(&self) -> &[&'static str] {
        &self.implements
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn is_assignable_to(&self, type_name: &str) -> bool {
        self.name == type_name || self.implements.contains(&type_name)
    }

    pub fn can_construct(&self) -> bool {
        self.constructor.is_some()
    }

    pub(crate) fn construct(&self) -> Result<Instance, Fault> {
        let constructor = self.constructor.as_ref().ok_or_else(|| {
            Fault::activation(self.name, format!("{} has no parameterless constructor", self.name))
        })?;
        constructor()
    }

    pub(crate) fn member(&self, kind: MemberKind, name: &str) -> Option<(usize, &Member)> {
        self.members
            .iter()
            .enumerate()
            .find(|(_, m)| m.kind == kind && m.name == name)
    }

    pub(crate) fn member_at(&self, index: usize) -> Option<&Member> {
        self.members.get(index)
    }
}

impl std::fmt::Debug for ClassEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassEntry")
            .field("name", &self.name)
            .field("implements", &self.implements)
            .field("members", &self.members.iter().map(|m| m.name).collect::<Vec<_>>())
            .finish()
    }
}

fn downcast<T: Remote>(instance: Instance) -> Result<Arc<T>, Fault> {
    instance
        .downcast::<T>()
        .map_err(|_| Fault::contract(format!("target is not a {}", T::TYPE_NAME)))
}

/// Builder handed to `Remote::describe`.
pub struct Class<T> {
    entry: ClassEntry,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Remote> Class<T> {
    fn new() -> Self {
        Self {
            entry: ClassEntry {
                name: T::TYPE_NAME,
                implements: Vec::new(),
                constructor: None,
                members: Vec::new(),
            },
            _marker: PhantomData,
        }
    }

    /// Registers the parameterless constructor used by activation.
    pub fn constructor<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.entry.constructor = Some(Box::new(move || Ok(Arc::new(f()) as Instance)));
        self
    }

    pub fn try_constructor<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> Result<T, Fault> + Send + Sync + 'static,
    {
        self.entry.constructor = Some(Box::new(move || Ok(Arc::new(f()?) as Instance)));
        self
    }

    /// Declares that proxies of this class may be cast to `U`.
    pub fn implements<U: Remote>(&mut self) -> &mut Self {
        if !self.entry.implements.contains(&U::TYPE_NAME) {
            self.entry.implements.push(U::TYPE_NAME);
        }
        self
    }

    /// Registers a synchronous method, `Fn(&T, A..) -> Result<R, Fault>`.
    pub fn method<Args, F>(&mut self, name: &'static str, f: F) -> &mut Self
    where
        F: SyncMethod<T, Args>,
    {
        let invoke: Invoke = Box::new(move |instance, args| {
            let this = downcast::<T>(instance)?;
            f.call(&this, args).map(Returned::Ready)
        });
        self.push(Member { name, kind: MemberKind::Method, is_async: false, params: F::params(), invoke })
    }

    /// Registers an asynchronous method, `Fn(Arc<T>, A..) -> impl Future<Output = Result<R, Fault>>`.
    ///
    /// Remote callers must set the await flag (`run_async`/`eval_async`).
    pub fn method_async<Args, F>(&mut self, name: &'static str, f: F) -> &mut Self
    where
        F: AsyncMethod<T, Args>,
    {
        let invoke: Invoke = Box::new(move |instance, args| {
            let this = downcast::<T>(instance)?;
            f.call(this, args).map(Returned::Pending)
        });
        self.push(Member { name, kind: MemberKind::Method, is_async: true, params: F::params(), invoke })
    }

    /// Registers a property getter.
    pub fn property<R, F>(&mut self, name: &'static str, f: F) -> &mut Self
    where
        F: Fn(&T) -> R + Send + Sync + 'static,
        R: IntoValue,
    {
        let invoke: Invoke = Box::new(move |instance, args| {
            if !args.is_empty() {
                return Err(Fault::argument("property reads take no arguments"));
            }
            let this = downcast::<T>(instance)?;
            f(&this).into_value().map(Returned::Ready)
        });
        self.push(Member { name, kind: MemberKind::Property, is_async: false, params: Vec::new(), invoke })
    }

    /// Last registration of a name wins.
    fn push(&mut self, member: Member) -> &mut Self {
        let existing = self
            .entry
            .members
            .iter()
            .position(|m| m.kind == member.kind && m.name == member.name);
        match existing {
            Some(index) => self.entry.members[index] = member,
            None => self.entry.members.push(member),
        }
        self
    }
}

const REF_TOKEN: u8 = 1;
const REF_NAME: u8 = 2;
const MEMBER_BITS: u32 = 16;

/// A decoded type reference.
#[derive(Debug, Clone)]
pub struct TypeDesc {
    pub(crate) name: String,
    pub(crate) class: Option<Arc<ClassEntry>>,
}

impl TypeDesc {
    pub(crate) fn of(class: Arc<ClassEntry>) -> Self {
        Self { name: class.name().to_string(), class: Some(class) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_assignable_to(&self, type_name: &str) -> bool {
        match &self.class {
            Some(class) => class.is_assignable_to(type_name),
            None => self.name == type_name,
        }
    }
}

struct Registered {
    class: Arc<ClassEntry>,
    local: bool,
}

/// A set of registered classes shared by every channel that uses it.
pub struct Module {
    name: String,
    classes: Vec<Registered>,
    by_name: HashMap<&'static str, usize>,
}

impl Module {
    pub fn builder(name: impl Into<String>) -> ModuleBuilder {
        ModuleBuilder { name: name.into(), classes: Vec::new() }
    }

    /// A module with no classes; only scalars and `Other` values travel.
    pub fn empty() -> Arc<Module> {
        Self::builder("empty").build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn class(&self, type_name: &str) -> Option<&Arc<ClassEntry>> {
        self.by_name.get(type_name).map(|i| &self.classes[*i].class)
    }

    pub fn class_of<T: Remote>(&self) -> Option<&Arc<ClassEntry>> {
        self.class(T::TYPE_NAME)
    }

    fn token(&self, type_name: &str) -> Option<i32> {
        let index = *self.by_name.get(type_name)?;
        if !self.classes[index].local {
            return None;
        }
        i32::try_from(index).ok()
    }

    fn class_by_token(&self, token: i32) -> Option<&Arc<ClassEntry>> {
        let index = usize::try_from(token).ok()?;
        self.classes.get(index).filter(|r| r.local).map(|r| &r.class)
    }

    pub(crate) fn write_type_ref(&self, w: &mut Writer, type_name: &str) -> duopack::Result<()> {
        match self.token(type_name) {
            Some(token) => {
                w.u8_raw(REF_TOKEN);
                w.i32_raw(token);
                Ok(())
            }
            None => {
                w.u8_raw(REF_NAME);
                w.str_raw(type_name)
            }
        }
    }

    pub(crate) fn read_type_ref(&self, r: &mut Reader) -> Result<TypeDesc, Fault> {
        match r.u8_raw()? {
            REF_TOKEN => {
                let token = r.i32_raw()?;
                let class = self
                    .class_by_token(token)
                    .ok_or_else(|| Fault::unknown_type(&format!("#{}", token)))?;
                Ok(TypeDesc::of(class.clone()))
            }
            REF_NAME => {
                let name = r.str_raw()?;
                Ok(TypeDesc { name: name.to_string(), class: self.class(name).cloned() })
            }
            other => Err(Fault::protocol(format!("invalid type ref form {}", other))),
        }
    }

    /// Writes a reference to `member` of `target`.
    ///
    /// Fails before anything is written if `target` is known and lacks the member.
    pub(crate) fn write_method_ref(
        &self,
        w: &mut Writer,
        target: &TypeDesc,
        kind: MemberKind,
        member: &str,
    ) -> Result<(), Fault> {
        let index = match &target.class {
            Some(class) => match class.member(kind, member) {
                Some((index, _)) => Some(index),
                None => return Err(Fault::unknown_member(class.name(), member)),
            },
            None => None,
        };

        let token = self.token(&target.name).zip(index).and_then(|(class, member)| {
            let member = u32::try_from(member).ok().filter(|m| *m < 1 << MEMBER_BITS)?;
            let class = u32::try_from(class).ok().filter(|c| *c < 1 << (31 - MEMBER_BITS))?;
            Some(((class << MEMBER_BITS) | member) as i32)
        });

        match token {
            Some(token) => {
                w.u8_raw(REF_TOKEN);
                w.i32_raw(token);
            }
            None => {
                w.u8_raw(REF_NAME);
                w.str_raw(&target.name)?;
                w.u8_raw(kind as u8);
                w.str_raw(member)?;
            }
        }
        Ok(())
    }

    /// Resolves a method reference to its class and member index.
    pub(crate) fn read_method_ref(&self, r: &mut Reader) -> Result<(Arc<ClassEntry>, usize), Fault> {
        match r.u8_raw()? {
            REF_TOKEN => {
                let token = r.i32_raw()? as u32;
                let class_token = (token >> MEMBER_BITS) as i32;
                let index = (token & ((1 << MEMBER_BITS) - 1)) as usize;
                let class = self
                    .class_by_token(class_token)
                    .ok_or_else(|| Fault::unknown_type(&format!("#{}", class_token)))?;
                if class.member_at(index).is_none() {
                    return Err(Fault::unknown_member(class.name(), &format!("#{}", index)));
                }
                Ok((class.clone(), index))
            }
            REF_NAME => {
                let type_name = r.str_raw()?;
                let kind = r.u8_raw()?;
                let member = r.str_raw()?;
                let class = self.class(type_name).ok_or_else(|| Fault::unknown_type(type_name))?;
                let (index, _) = MemberKind::from_u8(kind)
                    .and_then(|kind| class.member(kind, member))
                    .ok_or_else(|| Fault::unknown_member(type_name, member))?;
                Ok((class.clone(), index))
            }
            other => Err(Fault::protocol(format!("invalid method ref form {}", other))),
        }
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("classes", &self.classes.iter().map(|r| r.class.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// Fluent builder for a `Module`.
pub struct ModuleBuilder {
    name: String,
    classes: Vec<Registered>,
}

impl ModuleBuilder {
    /// Registers a class hosted by this module; it gets a compact token.
    pub fn register<T: Remote>(self) -> Self {
        self.add(ClassEntry::of::<T>(), true)
    }

    /// Registers a class that is always referenced by name on the wire.
    pub fn register_extern<T: Remote>(self) -> Self {
        self.add(ClassEntry::of::<T>(), false)
    }

    fn add(mut self, class: Arc<ClassEntry>, local: bool) -> Self {
        match self.classes.iter().position(|r| r.class.name() == class.name()) {
            Some(index) => self.classes[index] = Registered { class, local },
            None => self.classes.push(Registered { class, local }),
        }
        self
    }

    pub fn build(self) -> Arc<Module> {
        let by_name = self
            .classes
            .iter()
            .enumerate()
            .map(|(i, r)| (r.class.name(), i))
            .collect();
        Arc::new(Module { name: self.name, classes: self.classes, by_name })
    }
}
