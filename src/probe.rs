use futures::future::BoxFuture;
use log::{debug, warn};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::time::Duration;

use crate::counters::{aggregate, CounterSet};
use crate::error::{ControlPlaneError, LimitometerError, Result};
use crate::headers;
use crate::http::{last_segment, primary_interface_id, ArmResponse, ControlPlane, VirtualMachine};

pub const GET_VM: &str = "get_vm";
pub const GET_PRIMARY_NIC: &str = "get_primary_nic";
pub const LIST_LOAD_BALANCERS: &str = "list_load_balancers";
pub const LIST_VMS: &str = "list_vms";
pub const LIST_NICS: &str = "list_nics";

/// Status and headers of one completed probe; the body is of no interest.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl<T> From<ArmResponse<T>> for ProbeResponse {
    fn from(r: ArmResponse<T>) -> Self {
        Self {
            status: r.status,
            headers: r.headers,
        }
    }
}

/// State shared by the probes of a single run.
#[derive(Debug, Default)]
pub struct ProbeContext {
    pub vm_name: String,
    pub vm: Option<VirtualMachine>,
}

impl ProbeContext {
    pub fn new(vm_name: &str) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            vm: None,
        }
    }

    /// Name of the target VM's primary NIC, derived from the VM fetched
    /// earlier in the run.
    pub fn primary_nic_name(&self) -> std::result::Result<&str, ControlPlaneError> {
        let vm = self.vm.as_ref().ok_or_else(|| {
            ControlPlaneError::Unresolved(format!("vm {:?} was not retrieved", self.vm_name))
        })?;
        last_segment(primary_interface_id(vm)?)
    }
}

pub type ProbeFn = for<'a> fn(
    &'a dyn ControlPlane,
    &'a mut ProbeContext,
) -> BoxFuture<'a, std::result::Result<ProbeResponse, ControlPlaneError>>;

#[derive(Clone, Copy)]
pub struct Probe {
    pub name: &'static str,
    pub run: ProbeFn,
}

impl std::fmt::Debug for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probe").field("name", &self.name).finish()
    }
}

fn get_vm<'a>(
    client: &'a dyn ControlPlane,
    ctx: &'a mut ProbeContext,
) -> BoxFuture<'a, std::result::Result<ProbeResponse, ControlPlaneError>> {
    Box::pin(async move {
        let res = client.get_vm(&ctx.vm_name).await?;
        ctx.vm = res.value.clone();
        Ok(res.into())
    })
}

fn get_primary_nic<'a>(
    client: &'a dyn ControlPlane,
    ctx: &'a mut ProbeContext,
) -> BoxFuture<'a, std::result::Result<ProbeResponse, ControlPlaneError>> {
    Box::pin(async move {
        let nic = ctx.primary_nic_name()?;
        debug!("Primary NIC of {} is {}", ctx.vm_name, nic);
        Ok(client.get_nic(nic).await?.into())
    })
}

fn list_load_balancers<'a>(
    client: &'a dyn ControlPlane,
    _ctx: &'a mut ProbeContext,
) -> BoxFuture<'a, std::result::Result<ProbeResponse, ControlPlaneError>> {
    Box::pin(async move { Ok(client.list_load_balancers().await?.into()) })
}

fn list_vms<'a>(
    client: &'a dyn ControlPlane,
    _ctx: &'a mut ProbeContext,
) -> BoxFuture<'a, std::result::Result<ProbeResponse, ControlPlaneError>> {
    Box::pin(async move { Ok(client.list_vms().await?.into()) })
}

fn list_nics<'a>(
    client: &'a dyn ControlPlane,
    _ctx: &'a mut ProbeContext,
) -> BoxFuture<'a, std::result::Result<ProbeResponse, ControlPlaneError>> {
    Box::pin(async move { Ok(client.list_nics().await?.into()) })
}

/// Counters gathered by one run of the battery.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub counters: CounterSet,
    /// Probes that failed to complete and contributed nothing.
    pub skipped: Vec<&'static str>,
}

/// Ordered control-plane calls issued once per run, each bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct ProbeBattery {
    probes: Vec<Probe>,
    timeout: Duration,
}

impl ProbeBattery {
    pub fn new(probes: Vec<Probe>, timeout: Duration) -> Self {
        Self { probes, timeout }
    }

    /// get VM, get its primary NIC, list load balancers, list VMs, list NICs.
    pub fn standard(timeout: Duration) -> Self {
        Self::new(
            vec![
                Probe { name: GET_VM, run: get_vm },
                Probe { name: GET_PRIMARY_NIC, run: get_primary_nic },
                Probe { name: LIST_LOAD_BALANCERS, run: list_load_balancers },
                Probe { name: LIST_VMS, run: list_vms },
                Probe { name: LIST_NICS, run: list_nics },
            ],
            timeout,
        )
    }

    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    /// Run every probe in order against `client` and merge the counters of
    /// their responses.
    ///
    /// A probe that fails to complete is logged and skipped. A completed
    /// probe with a status other than 200 aborts the run, as does a counter
    /// that cannot be parsed.
    pub async fn collect(&self, client: &dyn ControlPlane, vm_name: &str) -> Result<Collection> {
        let mut ctx = ProbeContext::new(vm_name);
        let mut sets = Vec::with_capacity(self.probes.len());
        let mut skipped = Vec::new();

        for probe in &self.probes {
            let outcome = match tokio::time::timeout(self.timeout, (probe.run)(client, &mut ctx)).await {
                Ok(res) => res,
                Err(_) => Err(ControlPlaneError::Timeout(self.timeout)),
            };
            match outcome {
                Ok(response) => {
                    if response.status != StatusCode::OK {
                        return Err(LimitometerError::UntrustedResponse {
                            probe: probe.name,
                            status: response.status.as_u16(),
                        });
                    }
                    let set = headers::extract(&response.headers)?;
                    debug!("{} reported {} counters", probe.name, set.len());
                    sets.push(set);
                }
                Err(e) => {
                    warn!("failed to {}: {}", probe.name.replace('_', " "), e);
                    skipped.push(probe.name);
                }
            }
        }

        Ok(Collection {
            counters: aggregate(sets),
            skipped,
        })
    }
}
