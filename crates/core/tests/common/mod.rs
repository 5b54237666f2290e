#![allow(dead_code)]

use std::time::Duration;

use federation_rti::{
    AttributeHandle, FederateHandle, Notice, ObjectClassHandle, ObjectModel, Rti, RtiClient,
    RtiConfig,
};
use testresult::TestResult;

pub const FEDERATION: &str = "test-federation";
pub const VEHICLE: ObjectClassHandle = ObjectClassHandle::new(1);
pub const POSITION: AttributeHandle = AttributeHandle::new(1);
pub const VELOCITY: AttributeHandle = AttributeHandle::new(2);

pub fn vehicle_model() -> ObjectModel {
    ObjectModel::new().with_class(VEHICLE, "Vehicle", [POSITION, VELOCITY])
}

/// Starts an RTI with one federation and joins `count` federates, named `fed-1`..`fed-N`
/// and holding handles `1..=count`.
pub async fn federation(
    count: usize,
    config: RtiConfig,
    model: ObjectModel,
) -> TestResult<(Rti, Vec<RtiClient>)> {
    let rti = Rti::new(config, model);
    rti.create_federation(FEDERATION)?;
    let mut clients = Vec::with_capacity(count);
    for i in 1..=count {
        let client = rti.connect_local();
        let handle = client.join(FEDERATION, &format!("fed-{i}"), "test").await?;
        assert_eq!(handle, FederateHandle::new(i as u32));
        clients.push(client);
    }
    Ok((rti, clients))
}

/// Next notice matching `predicate`, failing after a generous (virtual) wait.
pub async fn expect_notice(
    client: &mut RtiClient,
    predicate: impl FnMut(&Notice) -> bool,
) -> TestResult<Notice> {
    let notice = tokio::time::timeout(
        Duration::from_secs(30),
        client.next_notice_matching(predicate),
    )
    .await?;
    notice.ok_or_else(|| "connection closed".into())
}

/// Asserts that no notice arrives within `wait`.
pub async fn expect_silence(client: &mut RtiClient, wait: Duration) {
    if let Ok(notice) = tokio::time::timeout(wait, client.next_notice()).await {
        panic!("unexpected notice {notice:?}");
    }
}
