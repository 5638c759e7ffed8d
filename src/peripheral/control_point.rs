// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Request/response transactions over control-point characteristics: a
//! single writable and notifying attribute where the peripheral answers a
//! written request with a notification.
//!
//! The client must have notifications enabled (or at least requested; the
//! runtime tracks the request so a race with the host's acknowledgement does
//! not reject the transaction). One transaction may be outstanding per
//! characteristic. The written request races a timeout against the response
//! notification; whichever finishes first settles the transaction.

use super::Peripheral;
use crate::codec::{decode_value, encode_value, ByteDecode, ByteEncode};
use crate::gatt::record_access::{
    RecordAccessControlPoint, RecordFilter, RECORD_ACCESS_CONTROL_POINT,
};
use crate::{Error, Result};
use uuid::Uuid;

impl Peripheral {
    /// Sends `request` to a control-point characteristic and waits for the
    /// decoded response notification.
    ///
    /// Fails with [`Error::ControlPointRequiresNotifying`] if notifications
    /// are neither enabled nor requested, with
    /// [`Error::ControlPointInProgress`] if a transaction is already
    /// outstanding, and with [`Error::Timeout`] when the configured deadline
    /// (default 20 s) passes without a response.
    pub async fn control_point_request<Request, Response>(
        &self,
        service: Uuid,
        characteristic: Uuid,
        request: &Request,
    ) -> Result<Response>
    where
        Request: ByteEncode,
        Response: ByteDecode,
    {
        let key = (service, characteristic);
        let discovered = self
            .characteristic(service, characteristic)
            .ok_or(Error::NotPresent {
                service,
                characteristic,
            })?;
        if !discovered.is_notifying && !self.notification_requested(key) {
            return Err(Error::ControlPointRequiresNotifying);
        }

        let (transaction_id, response) = self.begin_control_point_transaction(key)?;

        if let Err(error) = self.write(service, characteristic, encode_value(request)).await {
            self.clear_control_point_transaction(key, transaction_id);
            return Err(error);
        }

        let raw = match tokio::time::timeout(self.control_point_timeout(), response).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(Error::Cancelled),
            Err(_) => {
                self.clear_control_point_transaction(key, transaction_id);
                return Err(Error::Timeout);
            }
        };
        decode_value(&raw).ok_or(Error::IncompatibleDataFormat)
    }

    /// Issues a record-access request on the service's Record Access Control
    /// Point characteristic and returns the raw response value.
    pub async fn record_access_request(
        &self,
        service: Uuid,
        request: RecordAccessControlPoint,
    ) -> Result<RecordAccessControlPoint> {
        self.control_point_request(service, RECORD_ACCESS_CONTROL_POINT, &request)
            .await
    }

    /// Aborts the record-access operation in progress on `service`.
    pub async fn abort_record_access_operation(&self, service: Uuid) -> Result<()> {
        let request = RecordAccessControlPoint::abort_operation();
        let response = self.record_access_request(service, request).await?;
        response.general_response(request.op_code)
    }

    /// Requests transmission of the selected stored records. The records
    /// themselves arrive as notifications of the service's measurement
    /// characteristic; this call returns once the peripheral confirms the
    /// procedure.
    pub async fn report_stored_records(&self, service: Uuid, filter: RecordFilter) -> Result<()> {
        let request = RecordAccessControlPoint::report_stored_records(filter);
        let response = self.record_access_request(service, request).await?;
        response.general_response(request.op_code)
    }

    /// Deletes the selected stored records.
    pub async fn delete_stored_records(&self, service: Uuid, filter: RecordFilter) -> Result<()> {
        let request = RecordAccessControlPoint::delete_stored_records(filter);
        let response = self.record_access_request(service, request).await?;
        response.general_response(request.op_code)
    }

    /// Asks how many stored records match `filter`.
    pub async fn report_number_of_stored_records(
        &self,
        service: Uuid,
        filter: RecordFilter,
    ) -> Result<u16> {
        let request = RecordAccessControlPoint::report_number_of_stored_records(filter);
        let response = self.record_access_request(service, request).await?;
        response.number_of_stored_records_response()
    }
}
