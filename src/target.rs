//! iSCSI target
//!
//! An [`IscsiTarget`] is one named target served by the server. It wraps a
//! [`ScsiBackend`], adds the iSCSI-specific parts of the INQUIRY data the
//! backend produces, and carries the login authorization hook.

use crate::scsi::{
    version_descriptor, BlockDeviceBackend, DeviceIdentificationPage, IdentificationDescriptor,
    InquiryHooks, ScsiBackend, ScsiBlockDevice, ScsiOutcome, StandardInquiryData,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Decides whether an initiator may log in: (initiator endpoint, InitiatorName)
pub type AuthorizationHandler = dyn Fn(&SocketAddr, &str) -> bool + Send + Sync;

/// Observes or edits standard INQUIRY data after the target augmented it
pub type StandardInquiryHandler = dyn Fn(u16, &mut StandardInquiryData) + Send + Sync;

/// Observes or edits the Device Identification page after the target augmented it
pub type DeviceIdentificationHandler = dyn Fn(u16, &mut DeviceIdentificationPage) + Send + Sync;

/// A named iSCSI target backed by a SCSI execution engine
pub struct IscsiTarget {
    name: String,
    backend: Arc<dyn ScsiBackend>,
    authorization: Option<Box<AuthorizationHandler>>,
    standard_inquiry: Option<Box<StandardInquiryHandler>>,
    device_identification: Option<Box<DeviceIdentificationHandler>>,
}

impl fmt::Debug for IscsiTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IscsiTarget")
            .field("name", &self.name)
            .field("authorization", &self.authorization.is_some())
            .finish()
    }
}

impl IscsiTarget {
    pub fn new(name: impl Into<String>, backend: Arc<dyn ScsiBackend>) -> Self {
        IscsiTarget {
            name: name.into(),
            backend,
            authorization: None,
            standard_inquiry: None,
            device_identification: None,
        }
    }

    /// Target exposing a single block device as LUN 0
    pub fn with_block_device<D>(name: impl Into<String>, device: D) -> Self
    where
        D: ScsiBlockDevice + 'static,
    {
        IscsiTarget::new(name, Arc::new(BlockDeviceBackend::new(device)))
    }

    /// Install the login authorization hook. Without one every initiator is
    /// accepted.
    pub fn on_authorization_request<F>(mut self, handler: F) -> Self
    where
        F: Fn(&SocketAddr, &str) -> bool + Send + Sync + 'static,
    {
        self.authorization = Some(Box::new(handler));
        self
    }

    pub fn on_standard_inquiry<F>(mut self, handler: F) -> Self
    where
        F: Fn(u16, &mut StandardInquiryData) + Send + Sync + 'static,
    {
        self.standard_inquiry = Some(Box::new(handler));
        self
    }

    pub fn on_device_identification<F>(mut self, handler: F) -> Self
    where
        F: Fn(u16, &mut DeviceIdentificationPage) + Send + Sync + 'static,
    {
        self.device_identification = Some(Box::new(handler));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target names compare case-insensitively
    pub fn matches_name(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Execute one SCSI command on the backend
    pub fn execute_command(&self, cdb: &[u8], lun: u16, data: &[u8]) -> ScsiOutcome {
        self.backend.execute_command(cdb, lun, data, self)
    }

    /// Ask the authorization hook whether this initiator may log in
    pub fn authorize_initiator(&self, endpoint: &SocketAddr, initiator_name: &str) -> bool {
        match &self.authorization {
            Some(handler) => handler(endpoint, initiator_name),
            None => true,
        }
    }
}

impl InquiryHooks for IscsiTarget {
    fn standard_inquiry(&self, lun: u16, data: &mut StandardInquiryData) {
        data.version_descriptors.push(version_descriptor::ISCSI);
        if let Some(handler) = &self.standard_inquiry {
            handler(lun, data);
        }
    }

    fn device_identification(&self, lun: u16, page: &mut DeviceIdentificationPage) {
        page.descriptors
            .push(IdentificationDescriptor::scsi_name_string(&self.name));
        if let Some(handler) = &self.device_identification {
            handler(lun, page);
        }
    }
}

/// Find a target by name, ignoring ASCII case
pub fn find_target<'a>(targets: &'a [Arc<IscsiTarget>], name: &str) -> Option<&'a Arc<IscsiTarget>> {
    targets.iter().find(|t| t.matches_name(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::{scsi_opcode, scsi_status, NoInquiryHooks};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that builds INQUIRY data and passes it through the hooks
    struct InquiryOnly;

    impl ScsiBackend for InquiryOnly {
        fn execute_command(
            &self,
            cdb: &[u8],
            lun: u16,
            _data: &[u8],
            hooks: &dyn InquiryHooks,
        ) -> ScsiOutcome {
            if cdb[1] & 0x01 != 0 {
                let mut page = DeviceIdentificationPage::default();
                hooks.device_identification(lun, &mut page);
                return ScsiOutcome::good(page.to_bytes());
            }
            let mut data = StandardInquiryData {
                peripheral_qualifier: 0,
                peripheral_device_type: 0,
                version: 0x06,
                vendor_id: "TEST".to_string(),
                product_id: "Inquiry".to_string(),
                product_rev: "1".to_string(),
                version_descriptors: vec![version_descriptor::SAM_5],
            };
            hooks.standard_inquiry(lun, &mut data);
            ScsiOutcome::good(data.version_descriptors.iter().flat_map(|d| d.to_be_bytes()).collect())
        }
    }

    fn target() -> IscsiTarget {
        IscsiTarget::new("iqn.2025-12.local:storage.disk1", Arc::new(InquiryOnly))
    }

    #[test]
    fn test_standard_inquiry_gets_iscsi_descriptor() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let target = target().on_standard_inquiry(move |lun, data| {
            assert_eq!(lun, 0);
            assert_eq!(data.version_descriptors.last(), Some(&version_descriptor::ISCSI));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let outcome = target.execute_command(&[scsi_opcode::INQUIRY, 0, 0, 0, 96, 0], 0, &[]);
        assert_eq!(outcome.status, scsi_status::GOOD);
        assert_eq!(outcome.response, vec![0x00, 0xA0, 0x09, 0x60]);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_device_identification_gets_name_string() {
        let target = target();
        let outcome = target.execute_command(&[scsi_opcode::INQUIRY, 1, 0x83, 0, 255, 0], 0, &[]);
        let name = b"iqn.2025-12.local:storage.disk1";
        assert_eq!(outcome.response[1], 0x83);
        assert_eq!(outcome.response[4], 0x53);
        assert_eq!(outcome.response[5], 0xA8);
        assert_eq!(&outcome.response[8..8 + name.len()], name);
    }

    #[test]
    fn test_device_identification_handler_can_edit_page() {
        let target = target().on_device_identification(|_, page| {
            assert_eq!(page.descriptors.len(), 1);
            page.descriptors.clear();
        });
        let outcome = target.execute_command(&[scsi_opcode::INQUIRY, 1, 0x83, 0, 255, 0], 0, &[]);
        assert_eq!(outcome.response, vec![0x00, 0x83, 0x00, 0x00]);
    }

    #[test]
    fn test_backend_without_target_hooks_is_unchanged() {
        let mut data = DeviceIdentificationPage::default();
        NoInquiryHooks.device_identification(0, &mut data);
        assert!(data.descriptors.is_empty());
    }

    #[test]
    fn test_authorization_defaults_to_accept() {
        let endpoint: SocketAddr = "10.0.0.1:50000".parse().unwrap();
        assert!(target().authorize_initiator(&endpoint, "iqn.1993-08.org.debian:01:host"));

        let strict = target().on_authorization_request(|_, name| name.ends_with(":trusted"));
        assert!(!strict.authorize_initiator(&endpoint, "iqn.1993-08.org.debian:01:host"));
        assert!(strict.authorize_initiator(&endpoint, "iqn.1993-08.org.debian:01:trusted"));
    }

    #[test]
    fn test_find_target_ignores_case() {
        let targets = vec![Arc::new(target())];
        assert!(find_target(&targets, "IQN.2025-12.LOCAL:STORAGE.DISK1").is_some());
        assert!(find_target(&targets, "iqn.2025-12.local:other").is_none());
    }
}
