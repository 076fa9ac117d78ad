/*
Copyright 2021 Jakub Lewandowski

This file is part of EM27 Retrieval Pipeline.

EM27 Retrieval Pipeline is a free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 3 of the License, or
(at your option) any later version.

EM27 Retrieval Pipeline is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with EM27 Retrieval Pipeline. If not, see https://www.gnu.org/licenses/.
*/

//! Minimal time indexed tables of retrieval results.
//!
//! Timestamps are unix seconds (UTC). Missing values are `NaN`.

use crate::{configuration::DataType, errors::ExportError, metadata::SensorDataContext};
use chrono::{NaiveTime, TimeZone, Utc};
use std::{collections::BTreeMap, io::Write, path::Path};

/// Measurements of one sensor, one row per timestamp.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct SensorFrame {
    pub times: Vec<i64>,
    pub columns: Vec<(DataType, Vec<f64>)>,
}

impl SensorFrame {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// Reads the selected data types of a retrieval output csv. Only rows
/// within the time window of the context are kept.
pub fn read_output_csv(
    path: &Path,
    ctx: &SensorDataContext,
    data_types: &[DataType],
) -> Result<SensorFrame, ExportError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let column_index = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| ExportError::MissingColumn(name.to_string(), path.to_path_buf()))
    };

    let time_index = column_index("UTCtimeh")?;
    let value_indices = data_types
        .iter()
        .map(|dt| column_index(dt.column_name()))
        .collect::<Result<Vec<usize>, ExportError>>()?;

    let day_start = Utc
        .from_utc_datetime(&ctx.date().and_time(NaiveTime::MIN))
        .timestamp();
    let window = ctx.from_datetime.timestamp()..=ctx.to_datetime.timestamp();

    let mut frame = SensorFrame {
        times: vec![],
        columns: data_types.iter().map(|dt| (*dt, vec![])).collect(),
    };

    for record in reader.records() {
        let record = record?;
        // empty fields are missing values
        let parse = |index: usize| -> Result<f64, ExportError> {
            let field = record.get(index).unwrap_or_default();
            if field.is_empty() {
                return Ok(f64::NAN);
            }
            field
                .parse::<f64>()
                .map_err(|_| ExportError::InvalidValue(field.to_string(), path.to_path_buf()))
        };

        let hours = parse(time_index)?;
        if hours.is_nan() {
            continue;
        }

        let time = day_start + (hours * 3600.0).round() as i64;
        if !window.contains(&time) {
            continue;
        }

        frame.times.push(time);
        for ((_, values), index) in frame.columns.iter_mut().zip(&value_indices) {
            values.push(parse(*index)?);
        }
    }

    Ok(frame)
}

/// Averages the rows into buckets of `rate` seconds and fills gaps of up
/// to `max_gap` seconds by linear interpolation between the buckets.
pub fn resample(frame: &SensorFrame, rate: i64, max_gap: i64) -> SensorFrame {
    let rate = rate.max(1);

    // bucket start -> (sums, counts) per column
    let mut buckets: BTreeMap<i64, Vec<(f64, usize)>> = BTreeMap::new();
    for (row, time) in frame.times.iter().enumerate() {
        let bucket = buckets
            .entry(time.div_euclid(rate) * rate)
            .or_insert_with(|| vec![(0.0, 0); frame.columns.len()]);
        for (acc, (_, values)) in bucket.iter_mut().zip(&frame.columns) {
            let value = values[row];
            if !value.is_nan() {
                acc.0 += value;
                acc.1 += 1;
            }
        }
    }

    let (first, last) = match (buckets.keys().next(), buckets.keys().next_back()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => {
            return SensorFrame {
                times: vec![],
                columns: frame.columns.iter().map(|(dt, _)| (*dt, vec![])).collect(),
            }
        }
    };

    let times: Vec<i64> = (first..=last).step_by(rate as usize).collect();
    let mut columns = vec![];

    for (column, (data_type, _)) in frame.columns.iter().enumerate() {
        let known: BTreeMap<i64, f64> = buckets
            .iter()
            .filter(|(_, accs)| accs[column].1 > 0)
            .map(|(time, accs)| (*time, accs[column].0 / accs[column].1 as f64))
            .collect();

        let values = times
            .iter()
            .map(|time| interpolate(&known, *time, max_gap))
            .collect();
        columns.push((*data_type, values));
    }

    // rows without any value carry no information
    let keep: Vec<bool> = (0..times.len())
        .map(|row| columns.iter().any(|(_, values): &(DataType, Vec<f64>)| !values[row].is_nan()))
        .collect();

    SensorFrame {
        times: times
            .iter()
            .zip(&keep)
            .filter(|(_, k)| **k)
            .map(|(t, _)| *t)
            .collect(),
        columns: columns
            .into_iter()
            .map(|(dt, values)| {
                (
                    dt,
                    values
                        .into_iter()
                        .zip(&keep)
                        .filter(|(_, k)| **k)
                        .map(|(v, _)| v)
                        .collect(),
                )
            })
            .collect(),
    }
}

fn interpolate(known: &BTreeMap<i64, f64>, time: i64, max_gap: i64) -> f64 {
    if let Some(value) = known.get(&time) {
        return *value;
    }

    let before = known.range(..time).next_back();
    let after = known.range(time..).next();

    match (before, after) {
        (Some((t0, v0)), Some((t1, v1))) if t1 - t0 <= max_gap => {
            let fraction = (time - t0) as f64 / (t1 - t0) as f64;
            v0 + (v1 - v0) * fraction
        }
        _ => f64::NAN,
    }
}

/// Outer join of the sensor frames on their timestamps.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct MergedFrame {
    pub times: Vec<i64>,
    pub columns: Vec<(String, Vec<f64>)>,
}

/// Merges the frames into `<sensor>_<data type>` columns. Frames of the
/// same sensor share their columns.
pub fn merge(frames: &[(String, SensorFrame)]) -> MergedFrame {
    let mut rows: BTreeMap<i64, BTreeMap<String, f64>> = BTreeMap::new();
    let mut column_names: Vec<String> = vec![];

    for (sensor_id, frame) in frames {
        for (data_type, values) in &frame.columns {
            let name = format!("{}_{}", sensor_id, data_type.as_str());
            if !column_names.contains(&name) {
                column_names.push(name.clone());
            }
            for (time, value) in frame.times.iter().zip(values) {
                if !value.is_nan() {
                    rows.entry(*time).or_default().insert(name.clone(), *value);
                }
            }
        }
        for time in &frame.times {
            rows.entry(*time).or_default();
        }
    }

    let times: Vec<i64> = rows.keys().copied().collect();
    let columns = column_names
        .into_iter()
        .map(|name| {
            let values = rows
                .values()
                .map(|row| row.get(&name).copied().unwrap_or(f64::NAN))
                .collect();
            (name, values)
        })
        .collect();

    MergedFrame { times, columns }
}

/// Writes the frame as csv with an `utc` column first.
pub fn write_csv<W: Write>(writer: W, frame: &MergedFrame) -> Result<(), ExportError> {
    let mut writer = csv::Writer::from_writer(writer);

    let mut header = vec!["utc".to_string()];
    header.extend(frame.columns.iter().map(|(name, _)| name.clone()));
    writer.write_record(&header)?;

    for (row, time) in frame.times.iter().enumerate() {
        let mut record = vec![format_time(*time)];
        for (_, values) in &frame.columns {
            let value = values[row];
            record.push(if value.is_nan() {
                "NaN".to_string()
            } else {
                format!("{:.9}", value)
            });
        }
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

fn format_time(time: i64) -> String {
    match Utc.timestamp_opt(time, 0).single() {
        Some(datetime) => datetime.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        None => time.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::tests::{datetime, location};
    use float_cmp::approx_eq;
    use std::fs;

    fn context(from: &str, to: &str) -> SensorDataContext {
        SensorDataContext {
            sensor_id: "ma".to_string(),
            serial_number: 61,
            utc_offset: 0.0,
            pressure_data_source: "ma".to_string(),
            location: location("l1", 48.1, 11.5),
            from_datetime: datetime(from),
            to_datetime: datetime(to),
        }
    }

    fn day_start() -> i64 {
        datetime("2022-06-02T00:00:00+00:00").timestamp()
    }

    #[test]
    fn read_csv_within_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(
            &path,
            "HHMMSS_ID, UTCtimeh, gndP, XCO2\n\
             090000, 9.0, 950.1, 410.1\n\
             120000, 12.0, 950.2, 410.2\n\
             130000, 13.0, 950.3, 410.3\n",
        )
        .unwrap();

        let ctx = context("2022-06-02T10:00:00+00:00", "2022-06-02T23:59:59+00:00");
        let frame = read_output_csv(&path, &ctx, &[DataType::Xco2]).unwrap();

        assert_eq!(frame.times, vec![day_start() + 12 * 3600, day_start() + 13 * 3600]);
        assert_eq!(frame.columns[0].0, DataType::Xco2);
        assert!(approx_eq!(f64, frame.columns[0].1[1], 410.3, ulps = 2));

        assert!(matches!(
            read_output_csv(&path, &ctx, &[DataType::Xch4]),
            Err(ExportError::MissingColumn(..))
        ));
    }

    #[test]
    fn empty_fields_are_missing_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(
            &path,
            "HHMMSS_ID, UTCtimeh, gndP, XCO2\n\
             120000, 12.0, , 410.2\n\
             130000, , 950.3, 410.3\n\
             140000, 14.0, 950.4, \n",
        )
        .unwrap();

        let ctx = context("2022-06-02T00:00:00+00:00", "2022-06-02T23:59:59+00:00");
        let frame = read_output_csv(&path, &ctx, &[DataType::GndP, DataType::Xco2]).unwrap();

        // the row without time is dropped
        assert_eq!(frame.times, vec![day_start() + 12 * 3600, day_start() + 14 * 3600]);
        assert!(frame.columns[0].1[0].is_nan());
        assert!(approx_eq!(f64, frame.columns[0].1[1], 950.4, ulps = 2));
        assert!(approx_eq!(f64, frame.columns[1].1[0], 410.2, ulps = 2));
        assert!(frame.columns[1].1[1].is_nan());

        fs::write(&path, "HHMMSS_ID, UTCtimeh, gndP, XCO2\n120000, 12.0, n/a, 410.2\n").unwrap();
        assert!(matches!(
            read_output_csv(&path, &ctx, &[DataType::GndP]),
            Err(ExportError::InvalidValue(..))
        ));
    }

    #[test]
    fn resample_with_gaps() {
        let t0 = day_start();
        let frame = SensorFrame {
            times: vec![t0, t0 + 20, t0 + 60, t0 + 180, t0 + 600],
            columns: vec![(DataType::Xco2, vec![400.0, 402.0, 410.0, 420.0, 430.0])],
        };

        let resampled = resample(&frame, 60, 180);
        let values = &resampled.columns[0].1;

        // 240..540 lie in a gap of 420 s and are dropped
        assert_eq!(
            resampled.times,
            vec![t0, t0 + 60, t0 + 120, t0 + 180, t0 + 600]
        );
        assert!(approx_eq!(f64, values[0], 401.0, ulps = 2));
        assert!(approx_eq!(f64, values[1], 410.0, ulps = 2));
        assert!(approx_eq!(f64, values[2], 415.0, ulps = 2));
        assert!(approx_eq!(f64, values[3], 420.0, ulps = 2));
        assert!(approx_eq!(f64, values[4], 430.0, ulps = 2));
    }

    #[test]
    fn merge_and_write() {
        let t0 = day_start();
        let frames = vec![
            (
                "ma".to_string(),
                SensorFrame {
                    times: vec![t0, t0 + 60],
                    columns: vec![(DataType::Xco2, vec![410.0, 411.0])],
                },
            ),
            (
                "mb".to_string(),
                SensorFrame {
                    times: vec![t0 + 60, t0 + 120],
                    columns: vec![(DataType::Xco2, vec![412.0, f64::NAN])],
                },
            ),
        ];

        let merged = merge(&frames);
        assert_eq!(merged.times, vec![t0, t0 + 60, t0 + 120]);

        let mut buffer = vec![];
        write_csv(&mut buffer, &merged).unwrap();
        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            "utc,ma_xco2,mb_xco2\n\
             2022-06-02T00:00:00Z,410.000000000,NaN\n\
             2022-06-02T00:01:00Z,411.000000000,412.000000000\n\
             2022-06-02T00:02:00Z,NaN,NaN\n"
        );
    }
}
