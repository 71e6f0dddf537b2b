//! Guest file I/O (syscall 26): a fixed handle table over a sandbox
//! directory, plus pseudo handles for the host's standard streams.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::core::program::Leave;
use crate::core::simulator::Simulator;
use crate::trace::tracef;

// Sub-operations in R24.
pub const FILEIO_FOPEN: u8 = 0;
pub const FILEIO_FCLOSE: u8 = 1;
pub const FILEIO_FGETC: u8 = 2;
pub const FILEIO_FPUTC: u8 = 3;
pub const FILEIO_FEOF: u8 = 4;
pub const FILEIO_CLEARERR: u8 = 5;
pub const FILEIO_FSEEK: u8 = 6;
pub const FILEIO_FFLUSH: u8 = 7;
pub const FILEIO_FREAD: u8 = 8;
pub const FILEIO_FWRITE: u8 = 9;

// Magic values from avr-libc's stdio.h.
const AVRLIBC_SEEK_SET: u8 = 0;
const AVRLIBC_SEEK_CUR: u8 = 1;
const AVRLIBC_SEEK_END: u8 = 2;
const AVRLIBC_EOF: u32 = 0xFFFF; // 16-bit -1

/// Handles for the host's standard streams.
const HANDLE_STDIN: i8 = -1;
const HANDLE_STDOUT: i8 = -2;
const HANDLE_STDERR: i8 = -3;

/// Guest-visible handles are 1..=N_FILES; three more are taken by the
/// standard streams.
const N_FILES: usize = 8;

pub struct HostFile {
    file: File,
    binary: bool,
    eof: bool,
    name: String,
}

pub struct FileTable {
    slots: Vec<Option<HostFile>>,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            slots: (0..N_FILES).map(|_| None).collect(),
        }
    }

    fn get(&mut self, handle: i8) -> Result<&mut HostFile, Leave> {
        let idx = usize::try_from(i32::from(handle) - 1)
            .ok()
            .filter(|&i| i < N_FILES)
            .ok_or_else(|| Leave::HostIo(format!("file handle {handle} out of range")))?;
        self.slots[idx]
            .as_mut()
            .ok_or_else(|| Leave::HostIo(format!("file handle @{handle} not open")))
    }

    fn unused_slot(&self) -> Result<usize, Leave> {
        self.slots
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| Leave::HostIo(format!("ran out of {N_FILES} file handles")))
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

fn display_handle(handle: i8) -> String {
    match handle {
        HANDLE_STDIN => "@stdin".into(),
        HANDLE_STDOUT => "@stdout".into(),
        HANDLE_STDERR => "@stderr".into(),
        h => format!("@{h}"),
    }
}

fn open_options_for(mode: &str) -> Option<OpenOptions> {
    let mut opts = OpenOptions::new();
    match mode.trim_end_matches('b').trim_end_matches('t') {
        "r" => opts.read(true),
        "r+" => opts.read(true).write(true),
        "w" => opts.write(true).create(true).truncate(true),
        "w+" => opts.read(true).write(true).create(true).truncate(true),
        "a" => opts.append(true).create(true),
        "a+" => opts.read(true).append(true).create(true),
        _ => return None,
    };
    Some(opts)
}

impl Simulator {
    /// Syscall 26: operation in R24, up to 4 inline argument bytes in
    /// R20..R23 or a pointer to an argument block; the 32-bit result
    /// goes to R22..R25.
    pub(crate) fn sys_fileio(&mut self) -> Result<(), Leave> {
        let what = self.reg(24);
        let args = u32::from_le_bytes([self.ram[20], self.ram[21], self.ram[22], self.ram[23]]);

        let label = match what {
            FILEIO_FOPEN => "fopen",
            FILEIO_FCLOSE => "fclose",
            FILEIO_FGETC => "fgetc",
            FILEIO_FPUTC => "fputc",
            FILEIO_FEOF => "feof",
            FILEIO_CLEARERR => "clearerr",
            FILEIO_FSEEK => "fseek",
            FILEIO_FFLUSH => "fflush",
            FILEIO_FREAD => "fread",
            FILEIO_FWRITE => "fwrite",
            _ => {
                return Err(Leave::HostIo(format!(
                    "not implemented: syscall 26 file i/o handler (R24)->{what}"
                )));
            }
        };
        {
            let t = &mut self.trace;
            tracef!(t, "file i/o #{what}={label} (args)->{args:08x}");
        }

        let result = match what {
            FILEIO_FOPEN => self.host_fopen(args)?,
            FILEIO_FCLOSE => self.host_fclose(args)?,
            FILEIO_FGETC => self.host_fgetc(args)?,
            FILEIO_FPUTC => self.host_fputc(args)?,
            FILEIO_FEOF => self.host_feof(args)?,
            FILEIO_CLEARERR => self.host_clearerr(args)?,
            FILEIO_FSEEK => self.host_fseek(args)?,
            FILEIO_FFLUSH => self.host_fflush(args)?,
            FILEIO_FREAD => self.host_fread(args)?,
            _ => self.host_fwrite(args)?,
        };

        self.ram[22..26].copy_from_slice(&result.to_le_bytes());
        Ok(())
    }

    // FILE* fopen (const char *path, const char *mode)
    fn host_fopen(&mut self, args: u32) -> Result<u32, Leave> {
        let Some(sandbox) = self.opts.sandbox.clone() else {
            return Err(Leave::Usage(
                "file i/o requires option '-sbox SANDBOX'".into(),
            ));
        };

        let p_file = (args & 0xFFFF) as u16;
        let p_mode = (args >> 16) as u16;
        let s_file = self.read_guest_string(u32::from(p_file), false, 40);
        let s_mode = self.read_guest_string(u32::from(p_mode), false, 5);
        {
            let t = &mut self.trace;
            tracef!(t, " ({p_file:04x})->\"{s_file}\" ({p_mode:04x})->\"{s_mode}\"");
        }
        if s_file.contains("..") {
            return Err(Leave::HostIo(format!(
                "bad file name in syscall open: \"{s_file}\""
            )));
        }

        let slot = self.host.files.unused_slot()?;
        let path = sandbox.join(&s_file);
        let Some(opts) = open_options_for(&s_mode) else {
            return Err(Leave::HostIo(format!(
                "bad mode in syscall open: \"{s_mode}\""
            )));
        };

        match opts.open(&path) {
            Ok(file) => {
                let handle = (slot + 1) as u32;
                let t = &mut self.trace;
                tracef!(
                    t,
                    "\n*** @{handle} <- fopen \"{}\" for \"{s_mode}\"",
                    path.display()
                );
                self.host.files.slots[slot] = Some(HostFile {
                    file,
                    binary: s_mode.contains('b'),
                    eof: false,
                    name: format!("@{handle}"),
                });
                Ok(handle & 0xFF)
            }
            Err(e) => {
                {
                    let t = &mut self.trace;
                    tracef!(t, "\n*** cannot fopen \"{}\"", path.display());
                }
                log::debug!("file i/o: {}: {e}", path.display());
                Ok(0)
            }
        }
    }

    // int fclose (FILE*)
    fn host_fclose(&mut self, args: u32) -> Result<u32, Leave> {
        let handle = args as i8;
        if handle > 0 {
            let file = self.host.files.get(handle)?;
            let name = file.name.clone();
            let t = &mut self.trace;
            tracef!(t, " {name}");
            self.host.files.slots[(handle - 1) as usize] = None;
        } else {
            let t = &mut self.trace;
            tracef!(t, " {}", display_handle(handle));
        }
        Ok(0)
    }

    // int fgetc (FILE*)
    fn host_fgetc(&mut self, args: u32) -> Result<u32, Leave> {
        let handle = args as i8;
        {
            let t = &mut self.trace;
            tracef!(t, " {}", display_handle(handle));
        }

        let mut buf = [0u8; 1];
        let got = if handle == HANDLE_STDIN {
            std::io::stdin().read(&mut buf).unwrap_or(0)
        } else if handle < 0 {
            0
        } else {
            let file = self.host.files.get(handle)?;
            let got = file.file.read(&mut buf).unwrap_or(0);
            if got == 0 {
                file.eof = true;
            }
            got
        };

        if got == 0 {
            let t = &mut self.trace;
            tracef!(t, " -> EOF");
            Ok(AVRLIBC_EOF)
        } else {
            let t = &mut self.trace;
            tracef!(t, " -> {:02x}", buf[0]);
            Ok(u32::from(buf[0]))
        }
    }

    // int fputc (char c, FILE*)
    fn host_fputc(&mut self, args: u32) -> Result<u32, Leave> {
        let handle = (args >> 8) as i8;
        let c = args as u8;

        let binary = match handle {
            h if h > 0 => self.host.files.get(h)?.binary,
            _ => true,
        };
        if !binary && c == b'\r' {
            return Ok(0);
        }
        {
            let t = &mut self.trace;
            tracef!(t, " {} <- {c:02x}", display_handle(handle));
        }

        let ok = match handle {
            HANDLE_STDOUT => std::io::stdout().write_all(&[c]).is_ok(),
            HANDLE_STDERR => std::io::stderr().write_all(&[c]).is_ok(),
            HANDLE_STDIN => false,
            h => self.host.files.get(h)?.file.write_all(&[c]).is_ok(),
        };

        Ok(if ok { u32::from(c) } else { AVRLIBC_EOF })
    }

    // int feof (FILE*)
    fn host_feof(&mut self, args: u32) -> Result<u32, Leave> {
        let handle = args as i8;
        {
            let t = &mut self.trace;
            tracef!(t, " {}", display_handle(handle));
        }
        let c = if handle > 0 {
            u32::from(self.host.files.get(handle)?.eof)
        } else {
            0
        };
        let t = &mut self.trace;
        tracef!(t, " -> {c}");
        Ok(c)
    }

    // void clearerr (FILE*)
    fn host_clearerr(&mut self, args: u32) -> Result<u32, Leave> {
        let handle = args as i8;
        {
            let t = &mut self.trace;
            tracef!(t, " {}", display_handle(handle));
        }
        if handle > 0 {
            self.host.files.get(handle)?.eof = false;
        }
        Ok(0)
    }

    // int fseek (FILE*, long pos, int whence); arguments in a block.
    fn host_fseek(&mut self, args: u32) -> Result<u32, Leave> {
        let pargs = args & 0xFFFF;
        let handle = self.get_mem_value(pargs, 1, false) as i8;
        let pos = self.get_mem_value(pargs + 1, 4, false) as i32;
        let whence = self.get_mem_value(pargs + 5, 1, false) as u8;

        let s_whence = match whence {
            AVRLIBC_SEEK_SET => "SEEK_SET",
            AVRLIBC_SEEK_CUR => "SEEK_CUR",
            AVRLIBC_SEEK_END => "SEEK_END",
            _ => "?",
        };
        {
            let t = &mut self.trace;
            tracef!(
                t,
                " {} (pos)->{pos} (whence)->{whence}={s_whence}",
                display_handle(handle)
            );
        }

        if whence > 2 {
            return Err(Leave::HostIo(format!(
                "bad 3rd argument for fseek {}: {whence}",
                display_handle(handle)
            )));
        }
        if handle < 0 {
            return Err(Leave::HostIo(format!(
                "cannot seek in {}",
                display_handle(handle)
            )));
        }

        let seek = match whence {
            AVRLIBC_SEEK_SET => SeekFrom::Start(pos as u32 as u64),
            AVRLIBC_SEEK_CUR => SeekFrom::Current(i64::from(pos)),
            _ => SeekFrom::End(i64::from(pos)),
        };
        let file = self.host.files.get(handle)?;
        file.eof = false;
        Ok(match file.file.seek(seek) {
            Ok(_) => 0,
            Err(_) => AVRLIBC_EOF,
        })
    }

    // int fflush (FILE*); handle 0 flushes everything.
    fn host_fflush(&mut self, args: u32) -> Result<u32, Leave> {
        let handle = args as i8;
        if handle == 0 {
            let t = &mut self.trace;
            tracef!(t, " @all");
            let _ = std::io::stdout().flush();
            let _ = std::io::stderr().flush();
            for slot in self.host.files.slots.iter_mut().flatten() {
                let _ = slot.file.flush();
            }
            return Ok(0);
        }
        {
            let t = &mut self.trace;
            tracef!(t, " {}", display_handle(handle));
        }
        let ok = match handle {
            HANDLE_STDOUT => std::io::stdout().flush().is_ok(),
            HANDLE_STDERR => std::io::stderr().flush().is_ok(),
            HANDLE_STDIN => true,
            h => self.host.files.get(h)?.file.flush().is_ok(),
        };
        Ok(if ok { 0 } else { AVRLIBC_EOF })
    }

    fn fread_fwrite_args(&mut self, args: u32) -> (u16, usize, usize, i8) {
        let pargs = args & 0xFFFF;
        let ptr = self.get_mem_value(pargs, 2, false) as u16;
        let size = self.get_mem_value(pargs + 2, 2, false) as usize;
        let nmemb = self.get_mem_value(pargs + 4, 2, false) as usize;
        let handle = self.get_mem_value(pargs + 6, 1, false) as i8;
        (ptr, size, nmemb, handle)
    }

    // size_t fread (void *ptr, size_t size, size_t nmemb, FILE*)
    fn host_fread(&mut self, args: u32) -> Result<u32, Leave> {
        let (ptr, size, nmemb, handle) = self.fread_fwrite_args(args);
        {
            let t = &mut self.trace;
            tracef!(
                t,
                " {} (ptr)->{ptr:04x} (size)->{size} (nmemb)->{nmemb}",
                display_handle(handle)
            );
        }

        let total = size * nmemb;
        let start = usize::from(ptr);
        if size == 0 || total == 0 || start + total > self.ram.len() {
            return Ok(0);
        }

        let read = if handle == HANDLE_STDIN {
            std::io::stdin().read(&mut self.ram[start..start + total]).unwrap_or(0)
        } else if handle < 0 {
            0
        } else {
            let file = self.host.files.get(handle)?;
            let mut done = 0;
            loop {
                match file.file.read(&mut self.ram[start + done..start + total]) {
                    Ok(0) => {
                        file.eof = true;
                        break;
                    }
                    Ok(n) => {
                        done += n;
                        if done == total {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            done
        };
        Ok((read / size) as u32)
    }

    // size_t fwrite (const void *ptr, size_t size, size_t nmemb, FILE*)
    fn host_fwrite(&mut self, args: u32) -> Result<u32, Leave> {
        let (ptr, size, nmemb, handle) = self.fread_fwrite_args(args);
        {
            let t = &mut self.trace;
            tracef!(
                t,
                " {} (ptr)->{ptr:04x} (size)->{size} (nmemb)->{nmemb}",
                display_handle(handle)
            );
        }

        let total = size * nmemb;
        let start = usize::from(ptr);
        if size == 0 || total == 0 || start + total > self.ram.len() {
            return Ok(0);
        }
        let data = self.ram[start..start + total].to_vec();

        let ok = match handle {
            HANDLE_STDOUT => std::io::stdout().write_all(&data).is_ok(),
            HANDLE_STDERR => std::io::stderr().write_all(&data).is_ok(),
            HANDLE_STDIN => false,
            h => self.host.files.get(h)?.file.write_all(&data).is_ok(),
        };
        Ok(if ok { nmemb as u32 } else { 0 })
    }
}
