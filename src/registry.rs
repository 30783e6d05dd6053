//! Name to command resolution.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use crate::builtin::ScriptCommand;
use crate::command::{Command, CommandFactory};
use crate::error::{Result, ShellError};

/// Script files may omit this extension when invoked by name.
pub const SCRIPT_EXTENSION: &str = "sc";

/// Factory for commands that start from their `Default` state.
pub struct Factory<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Default for Factory<T> {
    fn default() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T: Command + Default + 'static> CommandFactory for Factory<T> {
    fn create(&self) -> Box<dyn Command> {
        Box::new(T::default())
    }
}

struct FnFactory<F>(F);

impl<F> CommandFactory for FnFactory<F>
where
    F: Fn() -> Box<dyn Command> + Send + Sync,
{
    fn create(&self) -> Box<dyn Command> {
        (self.0)()
    }
}

/// Registered commands plus the directories searched for scripts.
#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Arc<dyn CommandFactory>>,
    script_path: Vec<PathBuf>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`, replacing any previous registration.
    pub fn register(&mut self, name: &str, factory: impl CommandFactory + 'static) {
        if self
            .commands
            .insert(name.to_string(), Arc::new(factory))
            .is_some()
        {
            log::debug!("replaced command {name}");
        }
    }

    /// Register a closure producing fresh commands.
    pub fn register_with<F>(&mut self, name: &str, create: F)
    where
        F: Fn() -> Box<dyn Command> + Send + Sync + 'static,
    {
        self.register(name, FnFactory(create));
    }

    /// Directories searched for `<name>` and `<name>.sc` when no command matches.
    pub fn set_script_path(&mut self, dirs: Vec<PathBuf>) {
        self.script_path = dirs;
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }

    fn find_script(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() {
            return None;
        }
        self.script_path.iter().find_map(|dir| {
            let plain = dir.join(name);
            let with_extension = dir.join(format!("{name}.{SCRIPT_EXTENSION}"));
            [plain, with_extension].into_iter().find(|p| p.is_file())
        })
    }

    /// Fresh instance of command `name`, falling back to a script file.
    pub fn create(&self, name: &str) -> Result<Box<dyn Command>> {
        if let Some(factory) = self.commands.get(name) {
            return Ok(factory.create());
        }
        match self.find_script(name) {
            Some(path) => {
                log::debug!("{name}: running script {}", path.display());
                Ok(Box::new(ScriptCommand::new(path)))
            }
            None => Err(ShellError::CommandNotFound(name.to_string())),
        }
    }
}

/// Number of required arguments announced by an argument synopsis.
pub fn required_arguments(argument_help: &str) -> usize {
    argument_help.matches('<').count()
}

/// Check `args` (command name first) against the command's argument synopsis.
pub fn validate_arguments(command: &dyn Command, args: &[String]) -> Result<()> {
    let usage = command.argument_help();
    let given = args.len().saturating_sub(1);
    if given < required_arguments(usage) {
        return Err(ShellError::Usage {
            name: args.first().cloned().unwrap_or_default(),
            usage: usage.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::Echo;
    use crate::test_utils::{Probe, ProbeLog};

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unknown_command() {
        let registry = CommandRegistry::new();
        let err = registry.create("frobnicate").err().unwrap();
        assert_eq!(err.to_string(), "frobnicate: command not found");
    }

    #[test]
    fn test_every_lookup_is_a_fresh_instance() {
        let log = ProbeLog::default();
        let mut registry = CommandRegistry::new();
        let captured = log.clone();
        registry.register_with("probe", move || Box::new(Probe::new(&captured, "probe")));
        registry.register("echo", Factory::<Echo>::default());

        let ctx = crate::test_utils::context(&["probe"], None, Arc::new(crate::io_adapters::NullSink));
        registry.create("probe").unwrap().execute(&ctx).unwrap();
        registry.create("probe").unwrap().execute(&ctx).unwrap();
        assert_eq!(log.starts(), vec!["probe", "probe"]);
        assert_eq!(registry.names(), vec!["echo", "probe"]);
    }

    #[test]
    fn test_required_arguments_are_counted() {
        assert_eq!(required_arguments(""), 0);
        assert_eq!(required_arguments("[-i] [-v] <regexp>"), 1);
        assert_eq!(required_arguments("<pid> <signal> [more]"), 2);
    }

    #[test]
    fn test_validation_reports_usage() {
        let mut registry = CommandRegistry::new();
        registry.register("kill", Factory::<crate::builtin::Kill>::default());
        let kill = registry.create("kill").unwrap();

        let err = validate_arguments(kill.as_ref(), &args(&["kill"])).unwrap_err();
        assert_eq!(err.to_string(), "usage: kill <pid>");
        assert!(validate_arguments(kill.as_ref(), &args(&["kill", "3"])).is_ok());
    }

    #[test]
    fn test_script_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("boot.sc"), "echo booted\n").unwrap();
        std::fs::write(dir.path().join("plain"), "echo plain\n").unwrap();

        let mut registry = CommandRegistry::new();
        registry.set_script_path(vec![dir.path().to_path_buf()]);
        assert!(registry.create("boot").is_ok());
        assert!(registry.create("plain").is_ok());
        assert!(registry.create("missing").is_err());
    }
}
