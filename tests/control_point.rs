//! Control-point transactions over the Record Access Control Point.

mod common;

use bluekit::central::CentralManager;
use bluekit::gatt::record_access::{RacpResponseCode, RecordFilter};
use bluekit::testing::MockHost;
use bluekit::Error;
use common::*;
use std::time::Duration;
use uuid::Uuid;

async fn racp_peripheral(
    responder: impl Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
) -> (
    std::sync::Arc<MockHost>,
    CentralManager,
    std::sync::Arc<bluekit::testing::MockPeripheralHost>,
    bluekit::peripheral::Peripheral,
) {
    let host = MockHost::new();
    let config = bp_config();
    let central = CentralManager::new(host.clone(), config);
    let mock = add_bp_peripheral(&host, Uuid::from_u128(40));
    mock.set_control_point_responder(BP_SERVICE, RACP, responder);
    let peripheral = discover_and_connect(&host, &central, &mock).await;
    peripheral
        .enable_notifications(BP_SERVICE, RACP, true)
        .await
        .unwrap();
    (host, central, mock, peripheral)
}

#[tokio::test]
async fn control_point_requires_notifying() {
    let host = MockHost::new();
    let central = CentralManager::new(host.clone(), bp_config());
    let mock = add_bp_peripheral(&host, Uuid::from_u128(41));
    let peripheral = discover_and_connect(&host, &central, &mock).await;

    assert_eq!(
        peripheral
            .abort_record_access_operation(BP_SERVICE)
            .await,
        Err(Error::ControlPointRequiresNotifying)
    );
}

#[tokio::test]
async fn requested_notifications_suffice() {
    // the runtime tracks that notifications were requested before the host
    // acknowledged, so a control-point request racing the acknowledgement
    // is not rejected
    let host = MockHost::new();
    let central = CentralManager::new(host.clone(), bp_config());
    let mock = add_bp_peripheral(&host, Uuid::from_u128(42));
    mock.set_control_point_responder(BP_SERVICE, RACP, |request| {
        (request == [0x03, 0x00]).then(|| vec![0x06, 0x00, 0x03, 0x01])
    });
    let peripheral = discover_and_connect(&host, &central, &mock).await;

    mock.set_manual_notify_acks(true);
    let enable = {
        let peripheral = peripheral.clone();
        tokio::spawn(async move {
            peripheral
                .enable_notifications(BP_SERVICE, RACP, true)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    peripheral
        .abort_record_access_operation(BP_SERVICE)
        .await
        .unwrap();

    mock.complete_notify(BP_SERVICE, RACP, Ok(true));
    enable.await.unwrap().unwrap();
}

#[tokio::test]
async fn abort_operation_success() {
    let (_host, _central, mock, peripheral) = racp_peripheral(|request| {
        // {opCode: abort, operator: null} answered with a success general
        // response echoing the request op code
        (request == [0x03, 0x00]).then(|| vec![0x06, 0x00, 0x03, 0x01])
    })
    .await;

    peripheral
        .abort_record_access_operation(BP_SERVICE)
        .await
        .unwrap();
    assert_eq!(mock.writes().len(), 1);
    assert_eq!(mock.writes()[0].1, vec![0x03, 0x00]);
}

#[tokio::test]
async fn abort_operation_error_response_is_typed() {
    let (_host, _central, _mock, peripheral) = racp_peripheral(|request| {
        (request == [0x03, 0x00]).then(|| vec![0x06, 0x00, 0x03, 0x05])
    })
    .await;

    assert_eq!(
        peripheral
            .abort_record_access_operation(BP_SERVICE)
            .await,
        Err(Error::RecordAccess(RacpResponseCode::InvalidOperand))
    );
}

#[tokio::test]
async fn report_number_of_stored_records() {
    let (_host, _central, _mock, peripheral) = racp_peripheral(|request| {
        // operator allRecords; respond with 1234 records
        (request == [0x04, 0x01]).then(|| vec![0x05, 0x00, 0xd2, 0x04])
    })
    .await;

    let count = peripheral
        .report_number_of_stored_records(BP_SERVICE, RecordFilter::AllRecords)
        .await
        .unwrap();
    assert_eq!(count, 1234);
}

#[tokio::test]
async fn unexpected_response_op_code_is_a_format_error() {
    let (_host, _central, _mock, peripheral) = racp_peripheral(|request| {
        // answer the number request with a bogus op code
        (request == [0x04, 0x01]).then(|| vec![0x01, 0x00, 0xd2, 0x04])
    })
    .await;

    assert_eq!(
        peripheral
            .report_number_of_stored_records(BP_SERVICE, RecordFilter::AllRecords)
            .await,
        Err(Error::ResponseFormatError)
    );
}

#[tokio::test]
async fn wrong_operator_in_response_is_a_format_error() {
    let (_host, _central, _mock, peripheral) = racp_peripheral(|request| {
        (request == [0x04, 0x01]).then(|| vec![0x05, 0x01, 0xd2, 0x04])
    })
    .await;

    assert_eq!(
        peripheral
            .report_number_of_stored_records(BP_SERVICE, RecordFilter::AllRecords)
            .await,
        Err(Error::ResponseFormatError)
    );
}

#[tokio::test]
async fn only_one_transaction_per_characteristic() {
    // a responder that never answers keeps the first transaction open
    let (_host, _central, _mock, peripheral) = racp_peripheral(|_| None).await;

    let pending = {
        let peripheral = peripheral.clone();
        tokio::spawn(async move {
            peripheral
                .report_number_of_stored_records(BP_SERVICE, RecordFilter::AllRecords)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(
        peripheral
            .abort_record_access_operation(BP_SERVICE)
            .await,
        Err(Error::ControlPointInProgress)
    );
    pending.abort();
}

#[tokio::test]
async fn transactions_time_out() {
    let host = MockHost::new();
    let mut config = bp_config();
    config.control_point_timeout = Duration::from_millis(100);
    let central = CentralManager::new(host.clone(), config);
    let mock = add_bp_peripheral(&host, Uuid::from_u128(43));
    // never responds
    mock.set_control_point_responder(BP_SERVICE, RACP, |_| None);
    let peripheral = discover_and_connect(&host, &central, &mock).await;
    peripheral
        .enable_notifications(BP_SERVICE, RACP, true)
        .await
        .unwrap();

    let started = std::time::Instant::now();
    assert_eq!(
        peripheral
            .abort_record_access_operation(BP_SERVICE)
            .await,
        Err(Error::Timeout)
    );
    assert!(started.elapsed() >= Duration::from_millis(100));

    // the transaction slot is free again after the timeout
    assert_eq!(
        peripheral
            .abort_record_access_operation(BP_SERVICE)
            .await,
        Err(Error::Timeout)
    );
}

#[tokio::test]
async fn write_errors_abort_the_transaction() {
    let (_host, _central, mock, peripheral) = racp_peripheral(|request| {
        (request == [0x03, 0x00]).then(|| vec![0x06, 0x00, 0x03, 0x01])
    })
    .await;

    mock.fail_next_write(Error::Att(0x03));
    assert_eq!(
        peripheral
            .abort_record_access_operation(BP_SERVICE)
            .await,
        Err(Error::Att(0x03))
    );

    // the slot is free: the next request goes through
    peripheral
        .abort_record_access_operation(BP_SERVICE)
        .await
        .unwrap();
}

#[tokio::test]
async fn delete_and_report_with_filters_encode_the_operands() {
    let (_host, _central, mock, peripheral) = racp_peripheral(|request| {
        match request[0] {
            // delete: confirm success
            0x02 => Some(vec![0x06, 0x00, 0x02, 0x01]),
            // report: confirm success
            0x01 => Some(vec![0x06, 0x00, 0x01, 0x01]),
            _ => None,
        }
    })
    .await;

    peripheral
        .delete_stored_records(
            BP_SERVICE,
            RecordFilter::WithinInclusiveRange {
                filter_type: 0x01,
                min: 5,
                max: 10,
            },
        )
        .await
        .unwrap();
    peripheral
        .report_stored_records(
            BP_SERVICE,
            RecordFilter::GreaterThanOrEqualTo {
                filter_type: 0x01,
                value: 42,
            },
        )
        .await
        .unwrap();

    let writes = mock.writes();
    assert_eq!(writes[0].1, vec![0x02, 0x04, 0x01, 0x05, 0x00, 0x0a, 0x00]);
    assert_eq!(writes[1].1, vec![0x01, 0x03, 0x01, 0x2a, 0x00]);
}
