//! IPMI power control (spec §6 "IPMI"): a thin wrapper over the
//! `ipmitool` CLI, used exclusively by the fence executor.

use std::fmt::{self, Display};
use std::process::Command;

use failure::{Backtrace, Context, Fail};

#[derive(Debug)]
pub struct IpmiError {
    inner: Context<IpmiErrKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum IpmiErrKind {
    #[fail(display = "could not invoke ipmitool: {}", _0)]
    SpawnFailed(String),
    #[fail(display = "ipmitool chassis power {} against {} exited with status {}", _0, _1, _2)]
    NonZeroExit(String, String, String),
}

impl Fail for IpmiError {
    fn cause(&self) -> Option<&dyn Fail> { self.inner.cause() }
    fn backtrace(&self) -> Option<&Backtrace> { self.inner.backtrace() }
}
impl Display for IpmiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}
impl From<IpmiErrKind> for IpmiError {
    fn from(kind: IpmiErrKind) -> IpmiError {
        IpmiError { inner: Context::new(kind) }
    }
}
impl From<Context<IpmiErrKind>> for IpmiError {
    fn from(inner: Context<IpmiErrKind>) -> IpmiError {
        IpmiError { inner }
    }
}

pub type Result<T> = std::result::Result<T, IpmiError>;

/// Credentials needed to reach a node's BMC, mirroring
/// `fleetkeeper_core::model::IpmiCredentials` but named for this
/// module's own call shape (hostname/username/password triple, per
/// spec §6).
#[derive(Debug, Clone)]
pub struct IpmiTarget {
    pub hostname: String,
    pub username: String,
    pub password: String,
}

impl IpmiTarget {
    fn run(&self, subcommand: &str) -> Result<std::process::Output> {
        Command::new("ipmitool")
            .args(["-I", "lanplus", "-H", &self.hostname, "-U", &self.username, "-P", &self.password, "chassis", "power", subcommand])
            .output()
            .map_err(|e| IpmiErrKind::SpawnFailed(e.to_string()).into())
    }
}

/// `chassis power reset`. Returns `Ok(true)` on a zero exit code.
pub fn reset(target: &IpmiTarget) -> Result<bool> {
    let out = target.run("reset")?;
    Ok(out.status.success())
}

/// `chassis power status`, matched against the literal substring
/// `Chassis Power is on` (spec §6).
pub fn is_powered_on(target: &IpmiTarget) -> Result<bool> {
    let out = target.run("status")?;
    if !out.status.success() {
        return Err(IpmiErrKind::NonZeroExit("status".to_string(), target.hostname.clone(), out.status.to_string()).into());
    }
    Ok(String::from_utf8_lossy(&out.stdout).contains("Chassis Power is on"))
}

/// `chassis power on`.
pub fn power_on(target: &IpmiTarget) -> Result<bool> {
    let out = target.run("on")?;
    Ok(out.status.success())
}

/// Reset-or-recover sequence used by the fence executor's step 3
/// ("On non-zero return code, retry `chassis power status`; if off,
/// issue `chassis power on`").
pub fn reset_or_recover(target: &IpmiTarget) -> Result<()> {
    if reset(target)? {
        return Ok(());
    }
    if !is_powered_on(target)? {
        power_on(target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_output_matches_literal_substring() {
        let stdout = b"Chassis Power is on\n".to_vec();
        assert!(String::from_utf8_lossy(&stdout).contains("Chassis Power is on"));
        let stdout_off = b"Chassis Power is off\n".to_vec();
        assert!(!String::from_utf8_lossy(&stdout_off).contains("Chassis Power is on"));
    }
}
