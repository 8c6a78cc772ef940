// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The application record: what to exec, as whom, and in which role.

use command_fds::{CommandFdExt, FdMapping};
use kernel::{Decoder, Encoder, WireError};
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

/// Descriptor the child reads kernels from.
pub const CHILD_IN_FD: i32 = 100;
/// Descriptor the child writes kernels to.
pub const CHILD_OUT_FD: i32 = 101;
/// Environment variable carrying the child's application ID.
pub const APPLICATION_ID_ENV: &str = "LATTICE_APPLICATION_ID";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Master = 0,
    Slave = 1,
}

impl Role {
    fn from_wire(v: u8) -> Role {
        if v == 0 { Role::Master } else { Role::Slave }
    }
}

/// A user computation submitted to the cluster: execve-style argv plus
/// credentials and role.
#[derive(Debug, Clone)]
pub struct Application {
    pub id: u64,
    pub argv: Vec<String>,
    pub uid: u32,
    pub gid: u32,
    pub role: Role,
}

/// The parent's ends of a spawned worker's pipes.
pub(crate) struct ChildPipes {
    pub(crate) to_child: OwnedFd,
    pub(crate) from_child: OwnedFd,
}

impl Application {
    #[must_use]
    pub fn new(id: u64, argv: Vec<String>) -> Self {
        Self {
            id,
            argv,
            uid: 0,
            gid: 0,
            role: Role::Master,
        }
    }

    pub fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_u64(self.id);
        enc.put_u32(self.argv.len() as u32);
        for arg in &self.argv {
            enc.put_str(arg);
        }
        enc.put_u32(self.uid);
        enc.put_u32(self.gid);
        enc.put_u8(self.role as u8);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, WireError> {
        let id = dec.get_u64()?;
        let argc = dec.get_u32()? as usize;
        let mut argv = Vec::with_capacity(argc.min(256));
        for _ in 0..argc {
            argv.push(dec.get_str()?);
        }
        Ok(Self {
            id,
            argv,
            uid: dec.get_u32()?,
            gid: dec.get_u32()?,
            role: Role::from_wire(dec.get_u8()?),
        })
    }

    /// Fork and exec the worker. Its kernel channel ends are mapped to
    /// the fixed descriptors 100/101; the parent keeps the other ends,
    /// switched to non-blocking for the poller.
    pub(crate) fn execute(&self) -> io::Result<(Child, ChildPipes)> {
        if self.argv.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty argv"));
        }
        let (child_read, to_child) = nix::unistd::pipe().map_err(io::Error::from)?;
        let (from_child, child_write) = nix::unistd::pipe().map_err(io::Error::from)?;
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .env(APPLICATION_ID_ENV, self.id.to_string())
            .stdin(Stdio::null());
        cmd.fd_mappings(vec![
            FdMapping {
                parent_fd: child_read,
                child_fd: CHILD_IN_FD,
            },
            FdMapping {
                parent_fd: child_write,
                child_fd: CHILD_OUT_FD,
            },
        ])
        .map_err(|e| io::Error::other(e.to_string()))?;
        if nix::unistd::geteuid().is_root() && self.uid != 0 {
            cmd.uid(self.uid).gid(self.gid);
        }
        let child = cmd.spawn()?;
        set_nonblocking(&to_child)?;
        set_nonblocking(&from_child)?;
        Ok((
            child,
            ChildPipes {
                to_child,
                from_child,
            },
        ))
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(io::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn application_round_trip() {
        let mut app = Application::new(42, vec!["/usr/bin/env".into(), "true".into()]);
        app.uid = 1000;
        app.gid = 1000;
        app.role = Role::Slave;

        let mut buf = BytesMut::new();
        app.encode(&mut Encoder::new(&mut buf));
        let got = Application::decode(&mut Decoder::new(&buf)).unwrap();
        assert_eq!(got.id, 42);
        assert_eq!(got.argv, app.argv);
        assert_eq!(got.uid, 1000);
        assert_eq!(got.role, Role::Slave);
    }
}
