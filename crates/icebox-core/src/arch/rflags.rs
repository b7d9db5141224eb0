bitflags::bitflags! {
    /// The `RFLAGS` register.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Rflags: u64 {
        /// Carry flag.
        const CF = 1 << 0;
        /// Parity flag.
        const PF = 1 << 2;
        /// Auxiliary carry flag.
        const AF = 1 << 4;
        /// Zero flag.
        const ZF = 1 << 6;
        /// Sign flag.
        const SF = 1 << 7;
        /// Trap flag; set while single-stepping.
        const TF = 1 << 8;
        /// Interrupt enable flag.
        const IF = 1 << 9;
        /// Direction flag.
        const DF = 1 << 10;
        /// Overflow flag.
        const OF = 1 << 11;
        /// Resume flag.
        const RF = 1 << 16;
    }
}
