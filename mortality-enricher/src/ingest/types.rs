use std::fmt;
use std::str::FromStr;

use rdkafka::topic_partition_list::TopicPartitionListElem;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

/// One message pulled off the transport, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    pub partition: Partition,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

impl SourceMessage {
    pub fn new(partition: Partition, offset: i64, payload: Option<Vec<u8>>) -> Self {
        Self {
            partition,
            offset,
            payload,
        }
    }
}

/// Where a fresh subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartingPoint {
    Earliest,
    Latest,
    /// Next offset to consume, as restored from the sink cursor
    Resume(i64),
}

impl FromStr for StartingPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "earliest" | "beginning" | "smallest" => Ok(StartingPoint::Earliest),
            "latest" | "end" | "largest" => Ok(StartingPoint::Latest),
            other => Err(format!(
                "Unknown starting point: {other}, must be earliest or latest"
            )),
        }
    }
}

impl fmt::Display for StartingPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartingPoint::Earliest => f.write_str("earliest"),
            StartingPoint::Latest => f.write_str("latest"),
            StartingPoint::Resume(offset) => write!(f, "offset {offset}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starting_point_parses_kafka_reset_policies() {
        assert_eq!("earliest".parse(), Ok(StartingPoint::Earliest));
        assert_eq!(" Latest ".parse(), Ok(StartingPoint::Latest));
        assert_eq!("smallest".parse(), Ok(StartingPoint::Earliest));
        assert!("middle".parse::<StartingPoint>().is_err());
    }

    #[test]
    fn test_partition_display() {
        let partition = Partition::new("hospital_trends".to_string(), 3);
        assert_eq!(partition.to_string(), "hospital_trends:3");
    }
}
