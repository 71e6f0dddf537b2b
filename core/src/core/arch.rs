//! Device-architecture profiles for `-mmcu=ARCH`.
//!
//! Each profile self-registers via [`inventory::submit!`] with an
//! [`ArchEntry`]; the front end resolves names and lists the available
//! set at runtime without a central table.

/// Features of one `-mmcu` architecture.
#[derive(Clone, Copy, Debug)]
pub struct Arch {
    /// Name as known to `-mmcu=`.
    pub name: &'static str,
    /// PC is 3 bytes wide (CALL/RET push and pop an extra byte).
    pub pc_3bytes: bool,
    /// EICALL / EIJMP are available.
    pub has_eind: bool,
    /// XMEGA core: I/O file starts at 0, XCH/LAS/LAC/LAT available.
    pub is_xmega: bool,
    /// RAMPD exists (only affects address display).
    pub has_rampd: bool,
    /// Reduced AVRrc core (no MUL, MOVW, ADIW, LPM, ...).
    pub is_tiny: bool,
    /// Mask to detect whether the PC left the flash.
    pub flash_addr_mask: u32,
    /// Offset where flash appears in the RAM address space, or 0.
    pub flash_pm_offset: u32,
}

impl Arch {
    /// Offset of the I/O file in the data address space.
    #[inline]
    pub fn io_base(&self) -> u16 {
        if self.is_xmega { 0 } else { 0x20 }
    }

    #[inline]
    pub fn addr_sreg(&self) -> u16 {
        self.io_base() + 0x3F
    }

    #[inline]
    pub fn addr_sph(&self) -> u16 {
        self.io_base() + 0x3E
    }

    #[inline]
    pub fn addr_spl(&self) -> u16 {
        self.io_base() + 0x3D
    }

    #[inline]
    pub fn addr_eind(&self) -> u16 {
        self.io_base() + 0x3C
    }

    #[inline]
    pub fn addr_rampz(&self) -> u16 {
        self.io_base() + 0x3B
    }

    #[inline]
    pub fn addr_rampd(&self) -> u16 {
        self.io_base() + 0x38
    }

    // Magic ports bridging the guest to the host.

    /// 4-byte input port for cycle / instruction / random readings.
    #[inline]
    pub fn ticks_port(&self) -> u16 {
        self.io_base() + 0x24
    }

    #[inline]
    pub fn abort_port(&self) -> u16 {
        self.io_base() + 0x29
    }

    #[inline]
    pub fn log_port(&self) -> u16 {
        self.io_base() + 0x2A
    }

    #[inline]
    pub fn exit_port(&self) -> u16 {
        self.io_base() + 0x2F
    }

    /// stdin when read, stdout when written.
    #[inline]
    pub fn stdio_port(&self) -> u16 {
        self.io_base() + 0x32
    }

    /// Pushing with SP below this bound clobbers the register file and
    /// terminates the run.
    #[inline]
    pub fn sp_reserved_bound(&self) -> u16 {
        self.io_base() + 0x40
    }

    /// Display name of a special-function register, if `addr` is one.
    pub fn sfr_name(&self, addr: u32) -> Option<&'static str> {
        let addr = u16::try_from(addr).ok()?;
        if addr == self.addr_sreg() {
            Some("SREG")
        } else if addr == self.addr_sph() {
            Some("SPH")
        } else if addr == self.addr_spl() {
            Some("SPL")
        } else if addr == self.addr_eind() && self.has_eind {
            Some("EIND")
        } else if addr == self.addr_rampz() && self.flash_addr_mask > 0xFFFF {
            Some("RAMPZ")
        } else if addr == self.addr_rampd() && self.has_rampd {
            Some("RAMPD")
        } else {
            None
        }
    }
}

/// Registry entry wrapping one [`Arch`].
pub struct ArchEntry(pub Arch);

inventory::collect!(ArchEntry);

macro_rules! register_arch {
    ($name:literal, $pc3:literal, $eind:literal, $xmega:literal,
     $rampd:literal, $tiny:literal, $mask:literal, $pm:literal) => {
        inventory::submit! {
            ArchEntry(Arch {
                name: $name,
                pc_3bytes: $pc3,
                has_eind: $eind,
                is_xmega: $xmega,
                has_rampd: $rampd,
                is_tiny: $tiny,
                flash_addr_mask: $mask,
                flash_pm_offset: $pm,
            })
        }
    };
}

// name,       3-byte PC, EIND, XMEGA, RAMPD, TINY, flash mask, PM offset
register_arch!("avr2", false, false, false, false, false, 0x00ffff, 0);
register_arch!("avr25", false, false, false, false, false, 0x00ffff, 0);
register_arch!("avr3", false, false, false, false, false, 0x00ffff, 0);
register_arch!("avr31", false, false, false, false, false, 0x01ffff, 0);
register_arch!("avr35", false, false, false, false, false, 0x00ffff, 0);
register_arch!("avr4", false, false, false, false, false, 0x00ffff, 0);
register_arch!("avr5", false, false, false, false, false, 0x00ffff, 0);
register_arch!("avr51", false, false, false, false, false, 0x01ffff, 0);
register_arch!("avr6", true, true, false, false, false, 0x03ffff, 0);
register_arch!("avrxmega2", false, false, true, false, false, 0x00ffff, 0);
register_arch!("avrxmega3", false, false, true, false, false, 0x00ffff, 0x8000);
register_arch!("avrxmega4", false, false, true, false, false, 0x01ffff, 0);
register_arch!("avrxmega5", false, false, true, true, false, 0x01ffff, 0);
register_arch!("avrxmega6", true, true, true, false, false, 0x03ffff, 0);
register_arch!("avrxmega7", true, true, true, true, false, 0x03ffff, 0);
register_arch!("avrtiny", false, false, false, false, true, 0x01ffff, 0x4000);

/// Look up an architecture by its `-mmcu` name.
pub fn find(name: &str) -> Option<&'static Arch> {
    inventory::iter::<ArchEntry>
        .into_iter()
        .map(|e| &e.0)
        .find(|a| a.name == name)
}

/// All registered architectures, sorted by name.
pub fn all() -> Vec<&'static Arch> {
    let mut archs: Vec<_> = inventory::iter::<ArchEntry>.into_iter().map(|e| &e.0).collect();
    archs.sort_by_key(|a| a.name);
    archs
}

/// Profile assumed when no `-mmcu` is given.
pub fn default_arch() -> &'static Arch {
    find("avr51").expect("default arch not registered")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_all_known_names() {
        for name in [
            "avr2", "avr25", "avr3", "avr31", "avr35", "avr4", "avr5", "avr51", "avr6",
            "avrxmega2", "avrxmega3", "avrxmega4", "avrxmega5", "avrxmega6", "avrxmega7",
            "avrtiny",
        ] {
            assert!(find(name).is_some(), "missing arch {name}");
        }
        assert!(find("avr99").is_none());
    }

    #[test]
    fn classic_sfr_addresses() {
        let a = default_arch();
        assert_eq!(a.addr_sreg(), 0x5F);
        assert_eq!(a.addr_sph(), 0x5E);
        assert_eq!(a.addr_spl(), 0x5D);
        assert_eq!(a.sp_reserved_bound(), 0x60);
        assert_eq!(a.exit_port(), 0x4F);
        assert_eq!(a.stdio_port(), 0x52);
    }

    #[test]
    fn xmega_io_file_starts_at_zero() {
        let a = find("avrxmega6").unwrap();
        assert_eq!(a.io_base(), 0);
        assert_eq!(a.addr_sreg(), 0x3F);
        assert_eq!(a.addr_spl(), 0x3D);
    }
}
