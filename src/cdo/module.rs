// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Module handler tables keyed by module and api id.
// Author: Lukas Bower

use log::info;

use super::{CdoError, Command, ExecContext, HandlerError, MAX_MODULES};

/// Command handler. Runs once per invocation on the payload words available.
pub type Handler = fn(&mut Command<'_>, &mut ExecContext<'_>) -> Result<(), HandlerError>;

/// A command module: an id and its handlers indexed by api id.
#[derive(Debug, Clone)]
pub struct Module {
    id: u8,
    name: &'static str,
    handlers: Vec<Option<Handler>>,
}

impl Module {
    /// Module `id` with `handlers[api_id]`. Empty slots are reported as null handlers.
    pub fn new(id: u8, name: &'static str, handlers: Vec<Option<Handler>>) -> Self {
        Self { id, name, handlers }
    }

    /// Module id.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Module name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of api slots.
    pub fn api_count(&self) -> usize {
        self.handlers.len()
    }

    /// Resolve the handler for `api_id`.
    pub fn handler(&self, api_id: u8) -> Result<Handler, CdoError> {
        let slot = self
            .handlers
            .get(usize::from(api_id))
            .ok_or(CdoError::InvalidApiId {
                module_id: self.id,
                api_id,
            })?;
        slot.ok_or(CdoError::HandlerNull {
            module_id: self.id,
            api_id,
        })
    }
}

/// Registered modules, one slot per module id.
#[derive(Debug, Clone)]
pub struct ModuleTable {
    slots: Vec<Option<Module>>,
}

impl Default for ModuleTable {
    fn default() -> Self {
        Self {
            slots: vec![None; MAX_MODULES],
        }
    }
}

impl ModuleTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `module`. Ids must be below [`MAX_MODULES`] and unused.
    pub fn register(&mut self, module: Module) -> Result<(), CdoError> {
        let id = module.id;
        let slot = self
            .slots
            .get_mut(usize::from(id))
            .filter(|slot| slot.is_none())
            .ok_or(CdoError::Registration(id))?;
        info!(
            "[cdo] module {id} ({}) registered with {} apis",
            module.name,
            module.handlers.len()
        );
        *slot = Some(module);
        Ok(())
    }

    /// Module registered under `id`.
    pub fn get(&self, id: u8) -> Option<&Module> {
        self.slots.get(usize::from(id)).and_then(Option::as_ref)
    }

    /// Registered module ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.slots.iter().flatten().map(|m| m.id)
    }
}
