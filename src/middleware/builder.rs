use super::MiddlewareKind;
use crate::proxy::BoxHandler;
use crate::runtime::MiddlewareInfo;
use crate::service::{BuildContext, BuildError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;

/// The service a middleware list wraps.
#[derive(Debug, Clone)]
pub struct ServiceTarget {
    pub service: String,
    /// Default retry budget.
    pub server_count: usize,
}

/// Wraps service handlers with the middlewares a router declares.
///
/// Chains are expanded in place. Ordinary middlewares keep their declared
/// order and run first; resilience middlewares are moved next to the
/// service in their fixed order.
pub struct MiddlewareBuilder {
    middlewares: BTreeMap<String, Arc<MiddlewareInfo>>,
}

struct Flattened<'a> {
    name: String,
    info: &'a Arc<MiddlewareInfo>,
    kind: MiddlewareKind<'a>,
}

impl MiddlewareBuilder {
    pub fn new(middlewares: BTreeMap<String, Arc<MiddlewareInfo>>) -> Self {
        Self { middlewares }
    }

    pub fn build(
        &self,
        ctx: &BuildContext,
        names: &[String],
        target: &ServiceTarget,
        service: BoxHandler,
    ) -> Result<BoxHandler, BuildError> {
        let mut flat = Vec::new();
        self.flatten(ctx, names, &mut flat)?;

        let (mut resilience, plain): (Vec<_>, Vec<_>) = flat.into_iter().partition(|m| m.kind.stage().is_some());
        resilience.sort_by_key(|m| m.kind.stage());

        let mut handler = service;
        for m in resilience.iter().rev().chain(plain.iter().rev()) {
            handler = m.kind.apply(target, handler).map_err(|reason| {
                error!("Failed to build middleware '{}': {}", m.name, reason);
                let err = BuildError::InvalidMiddleware {
                    name: m.name.clone(),
                    reason,
                };
                m.info.add_error(&err, true);
                err
            })?;
        }
        Ok(handler)
    }

    fn flatten<'a>(
        &'a self,
        ctx: &BuildContext,
        names: &[String],
        out: &mut Vec<Flattened<'a>>,
    ) -> Result<(), BuildError> {
        for name in names {
            let qualified = ctx.qualify(name);
            let Some(info) = self.middlewares.get(&qualified) else {
                return Err(BuildError::MiddlewareNotFound(qualified));
            };

            let inner = ctx.enter(&qualified).inspect_err(|e| info.add_error(e, true))?;

            let kind = MiddlewareKind::of(&info.middleware).map_err(|reason| {
                let err = BuildError::InvalidMiddleware {
                    name: qualified.clone(),
                    reason,
                };
                info.add_error(&err, true);
                err
            })?;

            match kind {
                MiddlewareKind::Chain(chain) => {
                    self.flatten(&inner, &chain.middlewares, out)
                        .inspect_err(|e| info.add_error(e, true))?;
                }
                kind => out.push(Flattened {
                    name: qualified,
                    info,
                    kind,
                }),
            }
        }
        Ok(())
    }
}
