pub mod bios;
mod conversions;
pub mod devices;
pub mod errors;
pub mod fat12;
pub mod fields;
mod instructions;
pub mod loader;
pub mod memory;
mod parser;
mod processor;
pub mod psp;
pub mod storage;

use std::cell::RefCell;
use std::rc::Rc;

pub use bios::Bios;
pub use errors::{DosError, LoadError};
pub use fat12::Fat12;
pub use loader::SessionConfig;
pub use processor::{Cpu, HaltReason};
pub use storage::SectorStore;

/// Owns the whole running machine: interpreter, BIOS/DOS state, and the
/// FAT12 filesystem backing it. Generalizes the teacher's `Emulator`
/// (CPU + bus + memory layout) to a loaded BIOS/DOS program's session.
pub struct Session<S: SectorStore + 'static> {
    cpu: Cpu,
    bios: Rc<RefCell<Bios<S>>>,
    config: SessionConfig,
}

impl<S: SectorStore + 'static> Session<S> {
    pub fn new(fs: Fat12<S>, config: SessionConfig) -> Self {
        let mut cpu = Cpu::new();
        let bios = Bios::new(fs, config.psp_segment);
        Bios::install(&mut cpu, &bios);
        Session { cpu, bios, config }
    }

    /// Loads `image` (a COM or MZ byte stream) and leaves the interpreter
    /// poised at its entry point.
    pub fn load(&mut self, image: &[u8]) -> Result<(), LoadError> {
        loader::load(
            &mut self.cpu,
            image,
            self.config.psp_segment,
            self.config.env_segment,
            &self.config.command_tail,
            &self.config.program_name,
        )
    }

    /// Drives the loaded program until it exits, rendering once per tick
    /// via `on_tick` and pumping host keyboard input via `pump_keyboard`
    /// whenever the interpreter is suspended on a key-wait.
    pub fn run(&mut self, on_tick: impl FnMut(&Cpu), pump_keyboard: impl FnMut(&mut Cpu) -> bool) {
        loader::run_session(&mut self.cpu, &self.bios, on_tick, pump_keyboard)
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    /// Flushes the session's filesystem out to its backing medium.
    pub fn persist(&self) -> std::io::Result<()> {
        self.bios.borrow_mut().persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySectorStore;

    #[test]
    fn session_loads_and_runs_a_com_program_to_completion() {
        let mut fs = Fat12::new(MemorySectorStore::new());
        fs.format("TESTVOL");
        let mut session = Session::new(fs, SessionConfig::default());
        session.load(&[0xB4, 0x4C, 0xCD, 0x21]).unwrap();
        session.run(|_| {}, |_| false);
        assert!(session.cpu().halted);
        assert_eq!(session.cpu().halt_reason, HaltReason::ProgramExit);
    }
}
