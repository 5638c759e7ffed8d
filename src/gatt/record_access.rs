// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The Record Access Control Point (RACP): a request/response protocol over a
//! single writable and indicating characteristic, used by glucose meters and
//! other record-storing devices.
//!
//! Requests are built with the constructors on [`RecordAccessControlPoint`];
//! responses are checked with [`RecordAccessControlPoint::general_response`]
//! and [`RecordAccessControlPoint::number_of_stored_records_response`], which
//! enforce the op-code/operator/operand shape the protocol prescribes.

use crate::api::bleuuid::uuid_from_u16;
use crate::codec::{ByteDecode, ByteEncode, Endianness};
use crate::{Error, Result};
use uuid::Uuid;

/// The Record Access Control Point characteristic (write + indicate).
pub const RECORD_ACCESS_CONTROL_POINT: Uuid = uuid_from_u16(0x2a52);

/// A RACP op code. Unassigned values are representable but rejected by the
/// decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RacpOpCode(pub u8);

impl RacpOpCode {
    pub const REPORT_STORED_RECORDS: RacpOpCode = RacpOpCode(0x01);
    pub const DELETE_STORED_RECORDS: RacpOpCode = RacpOpCode(0x02);
    pub const ABORT_OPERATION: RacpOpCode = RacpOpCode(0x03);
    pub const REPORT_NUMBER_OF_STORED_RECORDS: RacpOpCode = RacpOpCode(0x04);
    pub const NUMBER_OF_STORED_RECORDS_RESPONSE: RacpOpCode = RacpOpCode(0x05);
    pub const RESPONSE_CODE: RacpOpCode = RacpOpCode(0x06);
}

/// A RACP operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RacpOperator(pub u8);

impl RacpOperator {
    pub const NULL: RacpOperator = RacpOperator(0x00);
    pub const ALL_RECORDS: RacpOperator = RacpOperator(0x01);
    pub const LESS_THAN_OR_EQUAL_TO: RacpOperator = RacpOperator(0x02);
    pub const GREATER_THAN_OR_EQUAL_TO: RacpOperator = RacpOperator(0x03);
    pub const WITHIN_INCLUSIVE_RANGE_OF: RacpOperator = RacpOperator(0x04);
    pub const FIRST_RECORD: RacpOperator = RacpOperator(0x05);
    pub const LAST_RECORD: RacpOperator = RacpOperator(0x06);
}

/// The response code carried in a general response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RacpResponseCode {
    Success,
    OpCodeNotSupported,
    InvalidOperator,
    OperatorNotSupported,
    InvalidOperand,
    NoRecordsFound,
    AbortUnsuccessful,
    ProcedureNotCompleted,
    OperandNotSupported,
    Reserved(u8),
}

impl RacpResponseCode {
    fn from_u8(value: u8) -> Self {
        match value {
            0x01 => RacpResponseCode::Success,
            0x02 => RacpResponseCode::OpCodeNotSupported,
            0x03 => RacpResponseCode::InvalidOperator,
            0x04 => RacpResponseCode::OperatorNotSupported,
            0x05 => RacpResponseCode::InvalidOperand,
            0x06 => RacpResponseCode::NoRecordsFound,
            0x07 => RacpResponseCode::AbortUnsuccessful,
            0x08 => RacpResponseCode::ProcedureNotCompleted,
            0x09 => RacpResponseCode::OperandNotSupported,
            other => RacpResponseCode::Reserved(other),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            RacpResponseCode::Success => 0x01,
            RacpResponseCode::OpCodeNotSupported => 0x02,
            RacpResponseCode::InvalidOperator => 0x03,
            RacpResponseCode::OperatorNotSupported => 0x04,
            RacpResponseCode::InvalidOperand => 0x05,
            RacpResponseCode::NoRecordsFound => 0x06,
            RacpResponseCode::AbortUnsuccessful => 0x07,
            RacpResponseCode::ProcedureNotCompleted => 0x08,
            RacpResponseCode::OperandNotSupported => 0x09,
            RacpResponseCode::Reserved(other) => other,
        }
    }
}

/// The operand of a RACP value. Which variant applies is determined by the
/// op code and operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RacpOperand {
    /// No operand bytes.
    None,
    /// A single-bound filter: `(filter type, value)`.
    Filter { filter_type: u8, value: u16 },
    /// A two-bound filter: `(filter type, minimum, maximum)`.
    Range {
        filter_type: u8,
        min: u16,
        max: u16,
    },
    /// The record count of a number-of-stored-records response.
    NumberOfRecords(u16),
    /// The operand of a general response: the echoed request op code and the
    /// outcome.
    GeneralResponse {
        request_op_code: RacpOpCode,
        response: RacpResponseCode,
    },
}

/// The filter-type code selecting the sequence-number field.
pub const FILTER_TYPE_SEQUENCE_NUMBER: u8 = 0x01;
/// The filter-type code selecting the user-facing-time field.
pub const FILTER_TYPE_USER_FACING_TIME: u8 = 0x02;

/// A record selection, lifted into the operator/operand pair of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFilter {
    AllRecords,
    FirstRecord,
    LastRecord,
    LessThanOrEqualTo { filter_type: u8, value: u16 },
    GreaterThanOrEqualTo { filter_type: u8, value: u16 },
    WithinInclusiveRange {
        filter_type: u8,
        min: u16,
        max: u16,
    },
}

impl RecordFilter {
    fn operator(self) -> RacpOperator {
        match self {
            RecordFilter::AllRecords => RacpOperator::ALL_RECORDS,
            RecordFilter::FirstRecord => RacpOperator::FIRST_RECORD,
            RecordFilter::LastRecord => RacpOperator::LAST_RECORD,
            RecordFilter::LessThanOrEqualTo { .. } => RacpOperator::LESS_THAN_OR_EQUAL_TO,
            RecordFilter::GreaterThanOrEqualTo { .. } => RacpOperator::GREATER_THAN_OR_EQUAL_TO,
            RecordFilter::WithinInclusiveRange { .. } => RacpOperator::WITHIN_INCLUSIVE_RANGE_OF,
        }
    }

    fn operand(self) -> RacpOperand {
        match self {
            RecordFilter::AllRecords | RecordFilter::FirstRecord | RecordFilter::LastRecord => {
                RacpOperand::None
            }
            RecordFilter::LessThanOrEqualTo { filter_type, value }
            | RecordFilter::GreaterThanOrEqualTo { filter_type, value } => RacpOperand::Filter {
                filter_type,
                value,
            },
            RecordFilter::WithinInclusiveRange {
                filter_type,
                min,
                max,
            } => RacpOperand::Range {
                filter_type,
                min,
                max,
            },
        }
    }
}

/// A Record Access Control Point value, request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordAccessControlPoint {
    pub op_code: RacpOpCode,
    pub operator: RacpOperator,
    pub operand: RacpOperand,
}

impl RecordAccessControlPoint {
    /// Requests transmission of the records selected by `filter`.
    pub fn report_stored_records(filter: RecordFilter) -> Self {
        RecordAccessControlPoint {
            op_code: RacpOpCode::REPORT_STORED_RECORDS,
            operator: filter.operator(),
            operand: filter.operand(),
        }
    }

    /// Requests deletion of the records selected by `filter`.
    pub fn delete_stored_records(filter: RecordFilter) -> Self {
        RecordAccessControlPoint {
            op_code: RacpOpCode::DELETE_STORED_RECORDS,
            operator: filter.operator(),
            operand: filter.operand(),
        }
    }

    /// Aborts the operation in progress.
    pub fn abort_operation() -> Self {
        RecordAccessControlPoint {
            op_code: RacpOpCode::ABORT_OPERATION,
            operator: RacpOperator::NULL,
            operand: RacpOperand::None,
        }
    }

    /// Requests the count of records selected by `filter`.
    pub fn report_number_of_stored_records(filter: RecordFilter) -> Self {
        RecordAccessControlPoint {
            op_code: RacpOpCode::REPORT_NUMBER_OF_STORED_RECORDS,
            operator: filter.operator(),
            operand: filter.operand(),
        }
    }

    /// Checks a general response against the originating request op code.
    /// The response must carry the response-code op code, the null operator
    /// and a general-response operand echoing `request`; anything else is a
    /// [`Error::ResponseFormatError`]. A non-success response code surfaces
    /// as [`Error::RecordAccess`].
    pub fn general_response(&self, request: RacpOpCode) -> Result<()> {
        if self.op_code != RacpOpCode::RESPONSE_CODE || self.operator != RacpOperator::NULL {
            return Err(Error::ResponseFormatError);
        }
        match self.operand {
            RacpOperand::GeneralResponse {
                request_op_code,
                response,
            } if request_op_code == request => match response {
                RacpResponseCode::Success => Ok(()),
                code => Err(Error::RecordAccess(code)),
            },
            _ => Err(Error::ResponseFormatError),
        }
    }

    /// Extracts the record count from a number-of-stored-records response. A
    /// general response with a failure code surfaces as
    /// [`Error::RecordAccess`]; any other shape is a
    /// [`Error::ResponseFormatError`].
    pub fn number_of_stored_records_response(&self) -> Result<u16> {
        if self.op_code == RacpOpCode::RESPONSE_CODE {
            self.general_response(RacpOpCode::REPORT_NUMBER_OF_STORED_RECORDS)?;
            return Err(Error::ResponseFormatError);
        }
        if self.op_code != RacpOpCode::NUMBER_OF_STORED_RECORDS_RESPONSE
            || self.operator != RacpOperator::NULL
        {
            return Err(Error::ResponseFormatError);
        }
        match self.operand {
            RacpOperand::NumberOfRecords(count) => Ok(count),
            _ => Err(Error::ResponseFormatError),
        }
    }
}

impl ByteDecode for RecordAccessControlPoint {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        let op_code = RacpOpCode(u8::decode(bytes, endianness)?);
        let operator = RacpOperator(u8::decode(bytes, endianness)?);
        let operand = match op_code {
            RacpOpCode::RESPONSE_CODE => RacpOperand::GeneralResponse {
                request_op_code: RacpOpCode(u8::decode(bytes, endianness)?),
                response: RacpResponseCode::from_u8(u8::decode(bytes, endianness)?),
            },
            RacpOpCode::NUMBER_OF_STORED_RECORDS_RESPONSE => {
                RacpOperand::NumberOfRecords(u16::decode(bytes, endianness)?)
            }
            RacpOpCode::REPORT_STORED_RECORDS
            | RacpOpCode::DELETE_STORED_RECORDS
            | RacpOpCode::REPORT_NUMBER_OF_STORED_RECORDS => match operator {
                RacpOperator::LESS_THAN_OR_EQUAL_TO | RacpOperator::GREATER_THAN_OR_EQUAL_TO => {
                    RacpOperand::Filter {
                        filter_type: u8::decode(bytes, endianness)?,
                        value: u16::decode(bytes, endianness)?,
                    }
                }
                RacpOperator::WITHIN_INCLUSIVE_RANGE_OF => RacpOperand::Range {
                    filter_type: u8::decode(bytes, endianness)?,
                    min: u16::decode(bytes, endianness)?,
                    max: u16::decode(bytes, endianness)?,
                },
                _ => RacpOperand::None,
            },
            RacpOpCode::ABORT_OPERATION => RacpOperand::None,
            _ => return None,
        };
        Some(RecordAccessControlPoint {
            op_code,
            operator,
            operand,
        })
    }
}

impl ByteEncode for RecordAccessControlPoint {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        self.op_code.0.encode(out, endianness);
        self.operator.0.encode(out, endianness);
        match self.operand {
            RacpOperand::None => {}
            RacpOperand::Filter { filter_type, value } => {
                filter_type.encode(out, endianness);
                value.encode(out, endianness);
            }
            RacpOperand::Range {
                filter_type,
                min,
                max,
            } => {
                filter_type.encode(out, endianness);
                min.encode(out, endianness);
                max.encode(out, endianness);
            }
            RacpOperand::NumberOfRecords(count) => count.encode(out, endianness),
            RacpOperand::GeneralResponse {
                request_op_code,
                response,
            } => {
                request_op_code.0.encode(out, endianness);
                response.to_u8().encode(out, endianness);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_value, encode_value};

    #[test]
    fn abort_wire_format() {
        let request = RecordAccessControlPoint::abort_operation();
        assert_eq!(encode_value(&request), vec![0x03, 0x00]);
        assert_eq!(decode_value::<RecordAccessControlPoint>(&[0x03, 0x00]), Some(request));
    }

    #[test]
    fn abort_success_response() {
        let response = decode_value::<RecordAccessControlPoint>(&[0x06, 0x00, 0x03, 0x01]).unwrap();
        assert_eq!(response.general_response(RacpOpCode::ABORT_OPERATION), Ok(()));
    }

    #[test]
    fn abort_error_response_is_typed() {
        let response = decode_value::<RecordAccessControlPoint>(&[0x06, 0x00, 0x03, 0x05]).unwrap();
        assert_eq!(
            response.general_response(RacpOpCode::ABORT_OPERATION),
            Err(Error::RecordAccess(RacpResponseCode::InvalidOperand))
        );
    }

    #[test]
    fn mismatched_request_op_code_is_a_format_error() {
        let response = decode_value::<RecordAccessControlPoint>(&[0x06, 0x00, 0x01, 0x01]).unwrap();
        assert_eq!(
            response.general_response(RacpOpCode::ABORT_OPERATION),
            Err(Error::ResponseFormatError)
        );
    }

    #[test]
    fn number_of_stored_records() {
        let request = RecordAccessControlPoint::report_number_of_stored_records(
            RecordFilter::AllRecords,
        );
        assert_eq!(encode_value(&request), vec![0x04, 0x01]);

        // 1234 = 0x04d2
        let response = decode_value::<RecordAccessControlPoint>(&[0x05, 0x00, 0xd2, 0x04]).unwrap();
        assert_eq!(response.number_of_stored_records_response(), Ok(1234));
    }

    #[test]
    fn number_response_with_wrong_operator_is_a_format_error() {
        let response = decode_value::<RecordAccessControlPoint>(&[0x05, 0x01, 0xd2, 0x04]).unwrap();
        assert_eq!(
            response.number_of_stored_records_response(),
            Err(Error::ResponseFormatError)
        );
    }

    #[test]
    fn number_request_rejected_with_general_response() {
        let response = decode_value::<RecordAccessControlPoint>(&[0x06, 0x00, 0x04, 0x06]).unwrap();
        assert_eq!(
            response.number_of_stored_records_response(),
            Err(Error::RecordAccess(RacpResponseCode::NoRecordsFound))
        );
    }

    #[test]
    fn filter_operands_round_trip() {
        let request = RecordAccessControlPoint::report_stored_records(
            RecordFilter::GreaterThanOrEqualTo {
                filter_type: FILTER_TYPE_SEQUENCE_NUMBER,
                value: 42,
            },
        );
        let encoded = encode_value(&request);
        assert_eq!(encoded, vec![0x01, 0x03, 0x01, 0x2a, 0x00]);
        assert_eq!(decode_value::<RecordAccessControlPoint>(&encoded), Some(request));

        let request = RecordAccessControlPoint::delete_stored_records(
            RecordFilter::WithinInclusiveRange {
                filter_type: FILTER_TYPE_SEQUENCE_NUMBER,
                min: 5,
                max: 10,
            },
        );
        let encoded = encode_value(&request);
        assert_eq!(encoded, vec![0x02, 0x04, 0x01, 0x05, 0x00, 0x0a, 0x00]);
        assert_eq!(decode_value::<RecordAccessControlPoint>(&encoded), Some(request));
    }

    #[test]
    fn unknown_op_code_fails_to_decode() {
        assert_eq!(decode_value::<RecordAccessControlPoint>(&[0x7f, 0x00]), None);
    }
}
