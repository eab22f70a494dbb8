//! Procedure execution
//!
//! [`Interpreter`] is the bundled backend: it walks the ops of a procedure
//! over an operand stack and a set of frame locals. Other backends can
//! translate procedures into something faster as long as they honor the
//! same stack discipline.

use super::{Constant, Op, Procedure};
use crate::lifetime::{Created, LifetimeContext, LifetimeStrategy};
use crate::metadata::Args;
use crate::scope::Scope;
use crate::types::{ServiceKey, TypeRef};
use crate::value::{Disposable, Func, Instance, Instances, Lazy};
use crate::{Container, DiError, Result};
use std::sync::Arc;

/// The environment of one procedure call.
pub struct Invocation<'a> {
    pub container: &'a Container,
    pub constants: &'a Arc<[Constant]>,
    pub scope: Option<&'a Arc<Scope>>,
    /// Runtime arguments, read by `PushArgument` and passed to factories.
    pub args: &'a [Instance],
}

/// A callable produced by a [`Backend`].
pub type Invoker = Arc<dyn Fn(&Invocation<'_>) -> Result<Instance> + Send + Sync>;

/// Turns procedures into invokers.
pub trait Backend: Send + Sync {
    fn compile(&self, procedure: Arc<Procedure>) -> Invoker;

    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Executes procedures op by op.
#[derive(Debug, Default, Clone, Copy)]
pub struct Interpreter;

impl Interpreter {
    pub fn execute(procedure: &Procedure, invocation: &Invocation<'_>) -> Result<Instance> {
        let mut frame = Frame::new(invocation, procedure.locals());
        frame.run(procedure.ops())?;
        frame.pop()
    }
}

impl Backend for Interpreter {
    fn compile(&self, procedure: Arc<Procedure>) -> Invoker {
        Arc::new(move |invocation: &Invocation<'_>| Interpreter::execute(&procedure, invocation))
    }

    fn name(&self) -> &'static str {
        "interpreter"
    }
}

fn corrupt(detail: impl Into<String>) -> DiError {
    DiError::creation_failed("procedure", detail)
}

struct Frame<'i, 'a> {
    invocation: &'i Invocation<'a>,
    stack: Vec<Instance>,
    locals: Vec<Option<Instance>>,
    /// Disposables captured for the innermost running lifetime body.
    captured: Vec<Arc<dyn Disposable>>,
}

impl<'i, 'a> Frame<'i, 'a> {
    fn new(invocation: &'i Invocation<'a>, locals: usize) -> Self {
        Self {
            invocation,
            stack: Vec::with_capacity(8),
            locals: vec![None; locals],
            captured: Vec::new(),
        }
    }

    #[inline]
    fn constant(&self, index: usize) -> Result<&'a Constant> {
        let constants: &'a Arc<[Constant]> = self.invocation.constants;
        constants
            .get(index)
            .ok_or_else(|| corrupt(format!("constant {index} out of range")))
    }

    fn procedure(&self, index: usize) -> Result<&'a Arc<Procedure>> {
        match self.constant(index)? {
            Constant::Procedure(procedure) => Ok(procedure),
            other => Err(corrupt(format!("expected procedure, found {other:?}"))),
        }
    }

    fn type_ref(&self, index: usize) -> Result<&'a TypeRef> {
        match self.constant(index)? {
            Constant::Type(ty) => Ok(ty),
            other => Err(corrupt(format!("expected type, found {other:?}"))),
        }
    }

    fn key(&self, index: usize) -> Result<&'a ServiceKey> {
        match self.constant(index)? {
            Constant::Key(key) => Ok(key),
            other => Err(corrupt(format!("expected service key, found {other:?}"))),
        }
    }

    #[inline]
    fn pop(&mut self) -> Result<Instance> {
        self.stack.pop().ok_or_else(|| corrupt("operand stack underflow"))
    }

    #[inline]
    fn top(&self) -> Result<&Instance> {
        self.stack.last().ok_or_else(|| corrupt("operand stack empty"))
    }

    fn pop_many(&mut self, count: usize) -> Result<Vec<Instance>> {
        let start = self
            .stack
            .len()
            .checked_sub(count)
            .ok_or_else(|| corrupt("operand stack underflow"))?;
        Ok(self.stack.split_off(start))
    }

    fn run(&mut self, ops: &[Op]) -> Result<()> {
        for op in ops {
            self.step(*op)?;
        }
        Ok(())
    }

    fn step(&mut self, op: Op) -> Result<()> {
        let invocation = self.invocation;
        match op {
            Op::PushConstant(index) => match self.constant(index)? {
                Constant::Value(value) => self.stack.push(value.clone()),
                other => return Err(corrupt(format!("expected value, found {other:?}"))),
            },
            Op::PushArgument(index) => {
                let value = invocation.args.get(index).ok_or(DiError::MissingArgument {
                    index,
                    supplied: invocation.args.len(),
                })?;
                self.stack.push(value.clone());
            }
            Op::StoreLocal(slot) => {
                let value = self.top()?.clone();
                if slot >= self.locals.len() {
                    self.locals.resize(slot + 1, None);
                }
                self.locals[slot] = Some(value);
            }
            Op::LoadLocalOr { slot, body } => {
                match self.locals.get(slot).cloned().flatten() {
                    Some(value) => self.stack.push(value),
                    None => {
                        let body = self.procedure(body)?;
                        self.run(body.ops())?;
                    }
                }
            }
            Op::Construct { constructor, argc } => {
                let Constant::Constructor { owner, invoke } = self.constant(constructor)? else {
                    return Err(corrupt("expected constructor"));
                };
                let values = self.pop_many(argc)?;
                let instance = invoke(&Args::new(owner.clone(), values))?;
                self.stack.push(instance);
            }
            Op::CallFactory(index) => {
                let Constant::Factory(factory) = self.constant(index)? else {
                    return Err(corrupt("expected factory"));
                };
                let instance = factory(invocation.container, invocation.args)?;
                self.stack.push(instance);
            }
            Op::SetProperty(index) => {
                let Constant::Setter(setter) = self.constant(index)? else {
                    return Err(corrupt("expected setter"));
                };
                let value = self.pop()?;
                setter(self.top()?, value)?;
            }
            Op::Initialize(index) => {
                let Constant::Initializer(initializer) = self.constant(index)? else {
                    return Err(corrupt("expected initializer"));
                };
                initializer(invocation.container, self.top()?)?;
            }
            Op::Decorate(index) => {
                let Constant::Decorator(decorator) = self.constant(index)? else {
                    return Err(corrupt("expected decorator"));
                };
                let inner = self.pop()?;
                let decorated = decorator(invocation.container, inner)?;
                self.stack.push(decorated);
            }
            Op::Cast(index) => {
                let Constant::Cast(cast) = self.constant(index)? else {
                    return Err(corrupt("expected cast"));
                };
                let value = self.pop()?;
                self.stack.push(cast(&value)?);
            }
            Op::Capture(index) => {
                let Constant::Disposer(disposer) = self.constant(index)? else {
                    return Err(corrupt("expected disposer"));
                };
                if let Some(disposable) = disposer(self.top()?) {
                    self.captured.push(disposable);
                }
            }
            Op::NewCollection { kind, item_type, len } => {
                let item_type = self.type_ref(item_type)?.clone();
                let items = self.pop_many(len)?;
                self.stack
                    .push(Instance::new(Instances::new(kind, item_type, items)));
            }
            Op::WithLifetime { lifetime, body } => {
                let Constant::Lifetime { strategy, service } = self.constant(lifetime)? else {
                    return Err(corrupt("expected lifetime"));
                };
                let body = self.procedure(body)?;
                let instance = self.with_lifetime(strategy.as_ref(), service, body)?;
                self.stack.push(instance);
            }
            Op::MakeLazy { service, body } => {
                let service = self.type_ref(service)?.clone();
                let body = Arc::clone(self.procedure(body)?);
                let container = invocation.container.downgrade();
                let constants = Arc::clone(invocation.constants);
                let scope = invocation.scope.cloned();
                let args = invocation.args.to_vec();

                let lazy = Lazy::new(
                    service,
                    Box::new(move || {
                        let container = container.upgrade().ok_or(DiError::ContainerDisposed)?;
                        Interpreter::execute(
                            &body,
                            &Invocation {
                                container: &container,
                                constants: &constants,
                                scope: scope.as_ref(),
                                args: &args,
                            },
                        )
                    }),
                );
                self.stack.push(Instance::new(lazy));
            }
            Op::ResolveLazy(index) => {
                let key = self.key(index)?.clone();
                let container = invocation.container.downgrade();
                let service = key.service_type.clone();
                let lazy = Lazy::new(
                    service,
                    Box::new(move || {
                        container
                            .upgrade()
                            .ok_or(DiError::ContainerDisposed)?
                            .get_instance(&key.service_type, &key.service_name)
                    }),
                );
                self.stack.push(Instance::new(lazy));
            }
            Op::ResolveFunc { service, arity } => {
                let key = self.key(service)?.clone();
                let container = invocation.container.downgrade();
                let service = key.service_type.clone();
                let func = Func::new(
                    service,
                    arity,
                    Box::new(move |args: &[Instance]| {
                        container
                            .upgrade()
                            .ok_or(DiError::ContainerDisposed)?
                            .get_instance_with_args(&key.service_type, &key.service_name, args)
                    }),
                );
                self.stack.push(Instance::new(func));
            }
        }
        Ok(())
    }

    fn with_lifetime(
        &mut self,
        strategy: &dyn LifetimeStrategy,
        service: &TypeRef,
        body: &Procedure,
    ) -> Result<Instance> {
        let invocation = self.invocation;
        let context = LifetimeContext {
            service,
            scope: invocation.scope,
            container: invocation.container.disposables(),
        };
        let mut create = || -> Result<Created> {
            let depth = self.captured.len();
            self.run(body.ops())?;
            let instance = self.pop()?;
            let disposable = if self.captured.len() > depth {
                let disposable = self.captured.pop();
                self.captured.truncate(depth);
                disposable
            } else {
                None
            };
            Ok(Created { instance, disposable })
        };
        strategy.get_instance(&mut create, &context)
    }
}
