//! Hickory DNS authority serving SRV records from the in-memory zone.

use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::rdata::{NS, SOA, SRV};
use hickory_proto::rr::{DNSClass, LowerName, Name, RData, Record, RecordSet, RecordType};
use hickory_server::authority::{
    Authority, LookupControlFlow, LookupError, LookupOptions, LookupRecords, MessageRequest,
    UpdateResult, ZoneType,
};
use hickory_server::server::RequestInfo;
use std::io;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::config::{DnsResponderConfig, SoaConfig};
use crate::metrics::{self, QueryResult, Timer};
use crate::record::ServiceRecordSet;
use crate::state::Zone;

/// Authority answering for `<service>.<origin>` out of a [`Zone`].
pub struct ZoneAuthority {
    origin: LowerName,
    /// Origin without the trailing dot, lowercased, for suffix matching.
    origin_label: String,
    ttl: u32,
    soa: SoaConfig,
    mname: Name,
    rname: Name,
    zone: Zone,
}

/// Where a query name falls relative to the origin.
#[derive(Debug, PartialEq, Eq)]
enum QueryTarget {
    Apex,
    Service(String),
    OutOfZone,
}

impl ZoneAuthority {
    /// Create an authority for the given responder configuration and zone.
    pub fn new(config: &DnsResponderConfig, zone: Zone) -> Result<Self, hickory_proto::ProtoError> {
        let origin_name = Name::from_ascii(&config.origin)?;
        let origin_label = config.origin.trim_end_matches('.').to_ascii_lowercase();

        Ok(Self {
            origin: origin_name.into(),
            origin_label,
            ttl: config.ttl,
            mname: Name::from_ascii(&config.soa.mname)?,
            rname: Name::from_ascii(&config.soa.rname)?,
            soa: config.soa.clone(),
            zone,
        })
    }

    /// Zone this authority reads.
    pub fn zone(&self) -> &Zone {
        &self.zone
    }

    fn classify(&self, name: &LowerName) -> QueryTarget {
        let name_str = name.to_string();
        let name_str = name_str.trim_end_matches('.');

        if name_str == self.origin_label {
            return QueryTarget::Apex;
        }
        if self.origin_label.is_empty() {
            return QueryTarget::Service(name_str.to_string());
        }
        match name_str.strip_suffix(self.origin_label.as_str()) {
            Some(rest) => match rest.strip_suffix('.') {
                Some(service) if !service.is_empty() => QueryTarget::Service(service.to_string()),
                _ => QueryTarget::OutOfZone,
            },
            None => QueryTarget::OutOfZone,
        }
    }

    fn build_srv_records(&self, name: Name, records: &ServiceRecordSet) -> RecordSet {
        let mut record_set = RecordSet::new(name.clone(), RecordType::SRV, self.zone.serial());

        for srv in records {
            let target = match Name::from_ascii(&srv.target) {
                Ok(target) => target,
                Err(e) => {
                    warn!(target = %srv.target, error = %e, "skipping record with invalid target");
                    continue;
                }
            };
            let rdata = SRV::new(srv.priority, srv.weight, srv.port, target);
            let mut record = Record::from_rdata(name.clone(), self.ttl, RData::SRV(rdata));
            record.set_dns_class(DNSClass::IN);
            record_set.insert(record, 0);
        }

        record_set
    }

    /// Build the SOA record for this zone.
    fn build_soa_record(&self) -> RecordSet {
        let soa = SOA::new(
            self.mname.clone(),
            self.rname.clone(),
            self.zone.serial(),
            self.soa.refresh as i32,
            self.soa.retry as i32,
            self.soa.expire as i32,
            self.soa.minimum,
        );

        let name = Name::from(self.origin.clone());
        let mut record_set = RecordSet::new(name.clone(), RecordType::SOA, 0);
        let mut record = Record::from_rdata(name, self.ttl, RData::SOA(soa));
        record.set_dns_class(DNSClass::IN);
        record_set.insert(record, 0);

        record_set
    }

    /// Build an NS record for this zone.
    fn build_ns_record(&self) -> RecordSet {
        let name = Name::from(self.origin.clone());

        let mut record_set = RecordSet::new(name.clone(), RecordType::NS, 0);
        let mut record = Record::from_rdata(name, self.ttl, RData::NS(NS(self.mname.clone())));
        record.set_dns_class(DNSClass::IN);
        record_set.insert(record, 0);

        record_set
    }
}

#[async_trait]
impl Authority for ZoneAuthority {
    type Lookup = LookupRecords;

    fn zone_type(&self) -> ZoneType {
        ZoneType::Primary
    }

    fn is_axfr_allowed(&self) -> bool {
        false
    }

    fn origin(&self) -> &LowerName {
        &self.origin
    }

    async fn lookup(
        &self,
        name: &LowerName,
        rtype: RecordType,
        lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        let timer = Timer::start();
        let rtype_str = format!("{:?}", rtype);

        if !self.zone.is_ready() {
            debug!("zone not seeded, returning SERVFAIL");
            metrics::record_query(&rtype_str, QueryResult::NotReady, timer.elapsed());
            return LookupControlFlow::Break(Err(LookupError::from(io::Error::new(
                io::ErrorKind::NotConnected,
                "zone not ready - initial seeding incomplete",
            ))));
        }

        trace!(name = %name, rtype = ?rtype, "DNS lookup");

        match (self.classify(name), rtype) {
            (QueryTarget::Apex, RecordType::SOA) => {
                debug!(name = %name, "SOA lookup");
                metrics::record_query(&rtype_str, QueryResult::Success, timer.elapsed());
                let record_set = Arc::new(self.build_soa_record());
                LookupControlFlow::Break(Ok(LookupRecords::new(lookup_options, record_set)))
            }
            (QueryTarget::Apex, RecordType::NS) => {
                debug!(name = %name, "NS lookup");
                metrics::record_query(&rtype_str, QueryResult::Success, timer.elapsed());
                let record_set = Arc::new(self.build_ns_record());
                LookupControlFlow::Break(Ok(LookupRecords::new(lookup_options, record_set)))
            }
            (QueryTarget::Apex, _) => {
                metrics::record_query(&rtype_str, QueryResult::Success, timer.elapsed());
                LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NoError)))
            }
            (QueryTarget::OutOfZone, _) => {
                debug!(name = %name, "query outside zone");
                metrics::record_query(&rtype_str, QueryResult::NxDomain, timer.elapsed());
                LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NXDomain)))
            }
            (QueryTarget::Service(service), rtype) => match self.zone.lookup(&service) {
                None => {
                    debug!(service = %service, "SRV lookup: no records found");
                    metrics::record_query(&rtype_str, QueryResult::NxDomain, timer.elapsed());
                    LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NXDomain)))
                }
                Some(records) if rtype == RecordType::SRV || rtype == RecordType::ANY => {
                    debug!(service = %service, count = records.len(), "SRV lookup: returning records");
                    metrics::record_srv_records_returned(records.len());
                    metrics::record_query(&rtype_str, QueryResult::Success, timer.elapsed());
                    let dns_name = Name::from(name.clone());
                    let record_set = Arc::new(self.build_srv_records(dns_name, &records));
                    LookupControlFlow::Break(Ok(LookupRecords::new(lookup_options, record_set)))
                }
                Some(_) => {
                    // Name exists but only SRV is served.
                    trace!(service = %service, rtype = ?rtype, "unsupported record type");
                    metrics::record_query(&rtype_str, QueryResult::Success, timer.elapsed());
                    LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NoError)))
                }
            },
        }
    }

    async fn search(
        &self,
        request_info: RequestInfo<'_>,
        lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        self.lookup(
            request_info.query.name(),
            request_info.query.query_type(),
            lookup_options,
        )
        .await
    }

    async fn get_nsec_records(
        &self,
        _name: &LowerName,
        _lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        // DNSSEC not supported
        LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NoError)))
    }

    async fn update(&self, _update: &MessageRequest) -> UpdateResult<bool> {
        // Dynamic updates not supported
        Err(ResponseCode::NotImp)
    }
}
