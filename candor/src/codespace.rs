//! Executable code pages.
//!
//! Finished code buffers are copied into anonymous mappings, frozen, and
//! made executable (write, then W^X flip via `memmap2`). Every page starts
//! with a 16-byte header whose first byte is the reserved code-page tag, so
//! heap scans can tell return addresses from object references; code starts
//! at the 16-byte-aligned offset after it. Pages live for the whole process
//! — there is no code collection.

use memmap2::{Mmap, MmapOptions};

use candor_rt::HeapTag;

use crate::masm::Assembler;

pub struct CodeSpace {
    chunks: Vec<Mmap>,
}

impl CodeSpace {
    pub fn new() -> CodeSpace {
        CodeSpace { chunks: Vec::new() }
    }

    /// Finalise `asm` into a fresh executable page and return the address
    /// of its first instruction.
    pub fn add(&mut self, asm: Assembler) -> u64 {
        let code_len = asm.offset() as usize;
        let mut map = MmapOptions::new()
            .len(code_len + 16)
            .map_anon()
            .expect("out of memory mapping a code page");

        let base = map.as_ptr() as u64 + 16;
        let code = asm.finalize(base);

        map[0] = HeapTag::Code as u8;
        map[16..16 + code_len].copy_from_slice(&code);

        let frozen = map.make_exec().expect("failed to make code page executable");
        debug_assert_eq!(frozen.as_ptr() as u64 + 16, base);
        self.chunks.push(frozen);
        base
    }
}

impl Default for CodeSpace {
    fn default() -> Self {
        CodeSpace::new()
    }
}
